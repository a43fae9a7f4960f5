use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variables are read as `DIPSIGNAL__SECTION__KEY`.
pub const ENV_PREFIX: &str = "DIPSIGNAL";
pub const DEFAULT_CONFIG_FILE: &str = "dipsignal";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Without a URL the run locks are process-local.
    pub url: Option<String>,
    pub lock_ttl_secs: u64,
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub gemini_api_key: Option<String>,
    pub fred_api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub daily_cron: String,
    pub weekly_cron: String,
    /// IANA name understood by chrono-tz.
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub yahoo_spacing_secs: u64,
    pub llm_spacing_secs: u64,
    /// How long a weekly run waits for an in-flight daily run to finish.
    pub weekly_wait_for_daily_secs: u64,
    /// Upper bound for a single node; asset analysis alone can take an hour.
    pub node_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub summary_model: String,
    pub top_news_model: String,
    pub macro_model: String,
    pub analysis_model: String,
    pub portfolio_model: String,
    pub news_batch_size: usize,
    pub scrape_concurrency: usize,
    pub backfill_scrape_concurrency: usize,
    pub news_batch_pause_secs: u64,
    pub analysis_interval_secs: u64,
    pub macro_pause_secs: u64,
    pub summarizer_lock_wait_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CryptoAssetConfig {
    /// Exchange pair, e.g. BTCUSDT.
    pub pair: String,
    /// Symbol stored in the asset dimension, e.g. BTC.
    pub symbol: String,
    pub name: Option<String>,
    pub coingecko_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetUniverse {
    pub crypto: Vec<CryptoAssetConfig>,
    pub equities: Vec<String>,
    pub commodities: Vec<String>,
    /// Macro column name -> FRED series id.
    pub macro_series: BTreeMap<String, String>,
    /// News source name -> RSS feed URL.
    pub news_feeds: BTreeMap<String, String>,
    /// GICS sector per equity symbol.
    pub sectors: Vec<SectorAssignment>,
}

/// Kept as a list because the config loader lowercases table keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SectorAssignment {
    pub symbol: String,
    pub sector: String,
}

impl AssetUniverse {
    pub fn sector_map(&self) -> BTreeMap<String, String> {
        self.sectors
            .iter()
            .map(|s| (s.symbol.clone(), s.sector.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub run_log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub http: HttpConfig,
    pub api: ApiKeys,
    pub schedule: ScheduleConfig,
    pub scheduler: SchedulerConfig,
    pub enrichment: EnrichmentConfig,
    pub assets: AssetUniverse,
    pub logs: LogsConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/dipsignal".to_string(),
            max_connections: 10,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            lock_ttl_secs: 4 * 3600,
            max_connections: 4,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: "Mozilla/5.0 (compatible; dipsignal-pipeline/0.1)".to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            daily_cron: "15 2 * * *".to_string(),
            weekly_cron: "15 4 * * 1".to_string(),
            timezone: "Etc/GMT-2".to_string(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            yahoo_spacing_secs: 3,
            llm_spacing_secs: 2,
            weekly_wait_for_daily_secs: 3 * 3600,
            node_timeout_secs: Some(3 * 3600),
        }
    }
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            summary_model: "gemma-3-27b-it".to_string(),
            top_news_model: "gemini-2.5-flash-lite".to_string(),
            macro_model: "gemma-3-27b-it".to_string(),
            analysis_model: "gemma-3-27b-it".to_string(),
            portfolio_model: "gemini-2.5-flash".to_string(),
            news_batch_size: 5,
            scrape_concurrency: 5,
            backfill_scrape_concurrency: 10,
            news_batch_pause_secs: 4,
            analysis_interval_secs: 60,
            macro_pause_secs: 2,
            summarizer_lock_wait_secs: 1800,
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            run_log_path: "logs/pipeline_runs.jsonl".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut macro_series = BTreeMap::new();
        macro_series.insert("sp500".to_string(), "SP500".to_string());
        macro_series.insert("cpi".to_string(), "CPIAUCSL".to_string());
        macro_series.insert("interest_rate".to_string(), "FEDFUNDS".to_string());
        macro_series.insert("unemployment_rate".to_string(), "UNRATE".to_string());
        macro_series.insert("gdp".to_string(), "GDP".to_string());

        Self {
            database: DatabaseConfig::default(),
            redis: RedisConfig::default(),
            http: HttpConfig::default(),
            api: ApiKeys::default(),
            schedule: ScheduleConfig::default(),
            scheduler: SchedulerConfig::default(),
            enrichment: EnrichmentConfig::default(),
            assets: AssetUniverse {
                macro_series,
                ..Default::default()
            },
            logs: LogsConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Layers, lowest priority first: built-in defaults, the optional config
    /// file, `DIPSIGNAL__*` variables, then the well-known credential
    /// variables (`DATABASE_URL`, `REDIS_URL`, `GEMINI_API_KEY`, `FRED_API_KEY`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&PipelineConfig::default())
            .context("Failed to serialize default configuration")?;

        let file = match path {
            Some(p) => config::File::from(p).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = config::Config::builder()
            .add_source(defaults)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("database.url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("redis.url", std::env::var("REDIS_URL").ok())?
            .set_override_option("api.gemini_api_key", std::env::var("GEMINI_API_KEY").ok())?
            .set_override_option("api.fred_api_key", std::env::var("FRED_API_KEY").ok())?
            .build()
            .context("Failed to build configuration")?;

        let config: PipelineConfig = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrency == 0 {
            anyhow::bail!("scheduler.max_concurrency must be at least 1");
        }
        if self.enrichment.news_batch_size == 0 {
            anyhow::bail!("enrichment.news_batch_size must be at least 1");
        }
        self.schedule
            .timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("invalid schedule.timezone: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.http.timeout(), Duration::from_secs(10));
        assert_eq!(config.schedule.daily_cron, "15 2 * * *");
    }

    #[test]
    fn bad_timezone_rejected() {
        let mut config = PipelineConfig::default();
        config.schedule.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_file_over_defaults() {
        let dir = std::env::temp_dir().join(format!("dipsignal-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pipeline.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
max_concurrency = 2

[assets]
equities = ["AAPL", "BRK.B"]

[[assets.crypto]]
pair = "BTCUSDT"
symbol = "BTC"
coingecko_id = "bitcoin"

[[assets.sectors]]
symbol = "AAPL"
sector = "Information Technology"
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.scheduler.yahoo_spacing_secs, 3);
        assert_eq!(config.scheduler.node_timeout_secs, Some(3 * 3600));
        assert_eq!(config.enrichment.news_batch_size, 5);
        assert_eq!(config.assets.equities, vec!["AAPL", "BRK.B"]);
        assert_eq!(config.assets.crypto[0].coingecko_id.as_deref(), Some("bitcoin"));
        assert_eq!(config.assets.crypto[0].name, None);
        assert!(config.assets.commodities.is_empty());
        assert_eq!(config.assets.macro_series["cpi"], "CPIAUCSL");
        assert_eq!(
            config.assets.sector_map()["AAPL"],
            "Information Technology"
        );
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn loads_without_a_file() {
        let config = PipelineConfig::load(None).unwrap();
        assert!(config.assets.crypto.is_empty());
        assert!(config.assets.equities.is_empty());
        assert!(config.assets.news_feeds.is_empty());
        assert!(config.assets.sectors.is_empty());
        assert_eq!(config.assets.macro_series.len(), 5);
        assert_eq!(config.schedule.timezone, "Etc/GMT-2");
        assert_eq!(config.scheduler.max_concurrency, 4);
        assert_eq!(config.logs.run_log_path, "logs/pipeline_runs.jsonl");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let parsed: PipelineConfig = serde_json::from_str(
            r#"{"scheduler":{"max_concurrency":8},"assets":{"equities":["MSFT"]}}"#,
        )
        .unwrap();
        assert_eq!(parsed.scheduler.max_concurrency, 8);
        assert_eq!(parsed.scheduler.llm_spacing_secs, 2);
        assert_eq!(parsed.database.max_connections, 10);
        assert_eq!(parsed.assets.equities, vec!["MSFT"]);
        assert!(parsed.assets.crypto.is_empty());
    }
}

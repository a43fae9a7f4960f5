use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Interval tag stored with every daily bar.
pub const DAILY_INTERVAL: &str = "1d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AssetClass {
    Crypto,
    Equity,
    Commodity,
}

impl AssetClass {
    pub const ALL: [AssetClass; 3] = [AssetClass::Crypto, AssetClass::Equity, AssetClass::Commodity];

    pub fn as_str(&self) -> &'static str {
        match self {
            AssetClass::Crypto => "CRYPTO",
            AssetClass::Equity => "EQUITY",
            AssetClass::Commodity => "COMMODITY",
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CRYPTO" => Ok(AssetClass::Crypto),
            "EQUITY" => Ok(AssetClass::Equity),
            "COMMODITY" => Ok(AssetClass::Commodity),
            other => Err(format!("unknown asset class '{}'", other)),
        }
    }
}

/// A tradable instrument. Identity (symbol, class) never changes after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub asset_id: i32,
    pub symbol: String,
    pub asset_class: AssetClass,
    pub name: String,
    pub sector: Option<String>,
}

/// One OHLCV bar plus the indicators computed for it at fetch time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub dynamic_metadata: Value,
}

impl PricePoint {
    pub fn daily(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            interval: DAILY_INTERVAL.to_string(),
            open,
            high,
            low,
            close,
            volume,
            dynamic_metadata: Value::Object(Default::default()),
        }
    }

    /// Checks the OHLCV invariants. Bars failing this are never persisted.
    pub fn validate(&self) -> Result<(), String> {
        let values = [self.open, self.high, self.low, self.close, self.volume];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(format!("non-finite value in bar at {}", self.timestamp));
        }
        if self.high < self.open || self.high < self.close || self.high < self.low {
            return Err(format!("high {} below open/close/low at {}", self.high, self.timestamp));
        }
        if self.low > self.open || self.low > self.close {
            return Err(format!("low {} above open/close at {}", self.low, self.timestamp));
        }
        if self.volume < 0.0 {
            return Err(format!("negative volume at {}", self.timestamp));
        }
        Ok(())
    }
}

/// Macro indicator columns persisted per calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MacroColumn {
    Dxy,
    Sp500,
    Cpi,
    InterestRate,
    Vix,
    Treasury10y,
    UnemploymentRate,
    Gdp,
}

impl MacroColumn {
    pub const ALL: [MacroColumn; 8] = [
        MacroColumn::Dxy,
        MacroColumn::Sp500,
        MacroColumn::Cpi,
        MacroColumn::InterestRate,
        MacroColumn::Vix,
        MacroColumn::Treasury10y,
        MacroColumn::UnemploymentRate,
        MacroColumn::Gdp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MacroColumn::Dxy => "dxy",
            MacroColumn::Sp500 => "sp500",
            MacroColumn::Cpi => "cpi",
            MacroColumn::InterestRate => "interest_rate",
            MacroColumn::Vix => "vix",
            MacroColumn::Treasury10y => "treasury_10y",
            MacroColumn::UnemploymentRate => "unemployment_rate",
            MacroColumn::Gdp => "gdp",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MacroIndicatorRow {
    pub date: NaiveDate,
    pub dxy: Option<f64>,
    pub sp500: Option<f64>,
    pub cpi: Option<f64>,
    pub interest_rate: Option<f64>,
    pub vix: Option<f64>,
    pub treasury_10y: Option<f64>,
    pub unemployment_rate: Option<f64>,
    pub gdp: Option<f64>,
    pub market_closed: bool,
}

impl MacroIndicatorRow {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            ..Default::default()
        }
    }

    pub fn get(&self, column: MacroColumn) -> Option<f64> {
        match column {
            MacroColumn::Dxy => self.dxy,
            MacroColumn::Sp500 => self.sp500,
            MacroColumn::Cpi => self.cpi,
            MacroColumn::InterestRate => self.interest_rate,
            MacroColumn::Vix => self.vix,
            MacroColumn::Treasury10y => self.treasury_10y,
            MacroColumn::UnemploymentRate => self.unemployment_rate,
            MacroColumn::Gdp => self.gdp,
        }
    }

    pub fn set(&mut self, column: MacroColumn, value: Option<f64>) {
        let slot = match column {
            MacroColumn::Dxy => &mut self.dxy,
            MacroColumn::Sp500 => &mut self.sp500,
            MacroColumn::Cpi => &mut self.cpi,
            MacroColumn::InterestRate => &mut self.interest_rate,
            MacroColumn::Vix => &mut self.vix,
            MacroColumn::Treasury10y => &mut self.treasury_10y,
            MacroColumn::UnemploymentRate => &mut self.unemployment_rate,
            MacroColumn::Gdp => &mut self.gdp,
        };
        *slot = value;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentPoint {
    pub date: NaiveDate,
    pub value: i32,
    pub classification: String,
}

impl SentimentPoint {
    pub fn validate(&self) -> Result<(), String> {
        if !(0..=100).contains(&self.value) {
            return Err(format!("sentiment value {} outside 0..=100 on {}", self.value, self.date));
        }
        Ok(())
    }
}

/// An article as produced by a news adapter, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDraft {
    pub url: String,
    pub source: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub related_tickers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub article_id: i64,
    pub url: String,
    pub source: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub related_tickers: Vec<String>,
}

impl NewsArticle {
    pub fn date(&self) -> NaiveDate {
        self.published_at.date_naive()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNewsEntry {
    pub date: NaiveDate,
    pub article_id: i64,
    pub importance_score: i32,
    pub rank_position: i32,
    pub model_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendSignal {
    Bullish,
    Bearish,
    Neutral,
}

impl TrendSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendSignal::Bullish => "Bullish",
            TrendSignal::Bearish => "Bearish",
            TrendSignal::Neutral => "Neutral",
        }
    }
}

impl FromStr for TrendSignal {
    type Err = String;

    /// Exact literal match only.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bullish" => Ok(TrendSignal::Bullish),
            "Bearish" => Ok(TrendSignal::Bearish),
            "Neutral" => Ok(TrendSignal::Neutral),
            other => Err(format!("invalid trend signal '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyLevels {
    pub support: Vec<f64>,
    pub resistance: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetAnalysis {
    pub asset_id: i32,
    pub date: NaiveDate,
    pub model_name: String,
    pub trend_signal: TrendSignal,
    pub key_levels: KeyLevels,
    pub summary_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroSummary {
    pub date: NaiveDate,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub model_name: String,
    pub summary_text: String,
    pub summary_short: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskProfile {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskProfile {
    pub const ALL: [RiskProfile; 3] = [
        RiskProfile::Conservative,
        RiskProfile::Moderate,
        RiskProfile::Aggressive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskProfile::Conservative => "Conservative",
            RiskProfile::Moderate => "Moderate",
            RiskProfile::Aggressive => "Aggressive",
        }
    }

    /// Target split the model is asked to respect.
    pub fn guidance(&self) -> Allocation {
        match self {
            RiskProfile::Conservative => Allocation {
                stocks: 50.0,
                commodities: 40.0,
                crypto: 10.0,
            },
            RiskProfile::Moderate => Allocation {
                stocks: 70.0,
                commodities: 20.0,
                crypto: 10.0,
            },
            RiskProfile::Aggressive => Allocation {
                stocks: 80.0,
                commodities: 10.0,
                crypto: 10.0,
            },
        }
    }
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub stocks: f64,
    pub crypto: f64,
    pub commodities: f64,
}

impl Allocation {
    pub fn total(&self) -> f64 {
        self.stocks + self.crypto + self.commodities
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPick {
    pub symbol: String,
    pub name: String,
    pub weight: f64,
    pub rationale: String,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub correlation_notes: Option<String>,
    #[serde(default)]
    pub price_momentum: Option<String>,
    #[serde(default)]
    pub volatility: Option<String>,
    #[serde(default)]
    pub volume_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioRecommendation {
    pub date: NaiveDate,
    pub risk_profile: RiskProfile,
    pub model_name: String,
    pub allocation: Allocation,
    pub top_picks: Vec<PortfolioPick>,
    pub sector_exposure: BTreeMap<String, f64>,
    pub diversification_score: Option<f64>,
    pub correlation_analysis: Option<String>,
    pub overall_rationale: String,
    pub news_impact: Option<String>,
    pub risks: Vec<String>,
    pub rebalance_frequency: Option<String>,
    pub metadata: Value,
}

/// Row of the calendar dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateDimension {
    pub date_id: i32,
    pub date: NaiveDate,
    pub year: i32,
    pub quarter: i32,
    pub month: i32,
    pub week: i32,
    pub day_of_week: i32,
    pub day_name: String,
    pub is_weekend: bool,
    pub is_us_market_open: bool,
    pub is_crypto_open: bool,
}

/// Tables watched by the freshness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MonitoredTable {
    AssetPrices,
    MacroIndicators,
    SentimentIndex,
    NewsArticles,
    AiAnalysis,
    MacroSummary,
    TopNews,
    PortfolioRecommendations,
}

impl MonitoredTable {
    pub const ALL: [MonitoredTable; 8] = [
        MonitoredTable::AssetPrices,
        MonitoredTable::MacroIndicators,
        MonitoredTable::SentimentIndex,
        MonitoredTable::NewsArticles,
        MonitoredTable::AiAnalysis,
        MonitoredTable::MacroSummary,
        MonitoredTable::TopNews,
        MonitoredTable::PortfolioRecommendations,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            MonitoredTable::AssetPrices => "fact_asset_prices",
            MonitoredTable::MacroIndicators => "fact_macro_indicators",
            MonitoredTable::SentimentIndex => "fact_sentiment_index",
            MonitoredTable::NewsArticles => "fact_news_articles",
            MonitoredTable::AiAnalysis => "fact_ai_analysis",
            MonitoredTable::MacroSummary => "fact_macro_summary",
            MonitoredTable::TopNews => "fact_top_news",
            MonitoredTable::PortfolioRecommendations => "fact_portfolio_recommendations",
        }
    }

    pub fn time_column(&self) -> &'static str {
        match self {
            MonitoredTable::AssetPrices => "timestamp",
            MonitoredTable::NewsArticles => "published_at",
            _ => "date",
        }
    }

    /// Date columns are read as midnight UTC of that date.
    pub fn is_date_column(&self) -> bool {
        !matches!(self, MonitoredTable::AssetPrices | MonitoredTable::NewsArticles)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageRow {
    pub asset_class: AssetClass,
    pub total_assets: i64,
    pub assets_with_data: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> PricePoint {
        PricePoint::daily(
            Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        )
    }

    #[test]
    fn ohlcv_invariants() {
        assert!(bar(10.0, 12.0, 9.0, 11.0, 100.0).validate().is_ok());
        assert!(bar(10.0, 10.0, 10.0, 10.0, 0.0).validate().is_ok());
        assert!(bar(10.0, 9.5, 9.0, 9.2, 1.0).validate().is_err());
        assert!(bar(10.0, 12.0, 10.5, 11.0, 1.0).validate().is_err());
        assert!(bar(10.0, 12.0, 9.0, 11.0, -1.0).validate().is_err());
        assert!(bar(f64::NAN, 12.0, 9.0, 11.0, 1.0).validate().is_err());
    }

    #[test]
    fn trend_signal_is_exact() {
        assert_eq!("Bullish".parse::<TrendSignal>(), Ok(TrendSignal::Bullish));
        assert!("bullish".parse::<TrendSignal>().is_err());
        assert!("Sideways".parse::<TrendSignal>().is_err());
    }

    #[test]
    fn risk_profile_guidance_sums_to_hundred() {
        for profile in RiskProfile::ALL {
            assert_eq!(profile.guidance().total(), 100.0);
        }
    }

    #[test]
    fn sentiment_range() {
        let date = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let point = |value| SentimentPoint {
            date,
            value,
            classification: "Fear".into(),
        };
        assert!(point(0).validate().is_ok());
        assert!(point(100).validate().is_ok());
        assert!(point(101).validate().is_err());
        assert!(point(-1).validate().is_err());
    }

    #[test]
    fn macro_columns_round_trip_by_name() {
        for column in MacroColumn::ALL {
            assert_eq!(MacroColumn::from_name(column.name()), Some(column));
        }
        assert_eq!(MacroColumn::from_name("gold"), None);
    }
}

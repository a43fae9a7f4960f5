//! Scripted collaborators for driving the real pipeline graph in-process.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use dipsignal_pipeline::cache::LocalRunLock;
use dipsignal_pipeline::config::{CryptoAssetConfig, PipelineConfig};
use dipsignal_pipeline::database::models::{ArticleDraft, PricePoint, SentimentPoint};
use dipsignal_pipeline::database::MemoryWarehouse;
use dipsignal_pipeline::error::SourceError;
use dipsignal_pipeline::processor::pipeline::PipelineDeps;
use dipsignal_pipeline::sources::{
    ArticleScraper, CryptoPriceSource, DailyBarSource, EquityNewsSource, FeedItem, FeedSource,
    LanguageModel, MacroSeriesSource, MarketCapSource, SentimentSource,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const FEED_URL: &str = "https://feeds.example/crypto.rss";

/// Wednesday, a regular NYSE session.
pub fn run_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

pub fn bars(days: usize, first_close: f64) -> Vec<PricePoint> {
    let start = run_date() - Duration::days(days as i64);
    (0..days)
        .map(|i| {
            let close = first_close + i as f64;
            let ts = (start + Duration::days(i as i64)).and_time(NaiveTime::MIN).and_utc();
            PricePoint::daily(ts, close - 0.5, close + 1.0, close - 1.0, close, 5_000.0)
        })
        .collect()
}

fn missing(what: &str) -> SourceError {
    SourceError::Empty(what.to_string())
}

/// Every market-data concern answered from fixed tables keyed by symbol.
pub struct Market {
    bars: BTreeMap<String, Vec<PricePoint>>,
}

impl Market {
    pub fn standard() -> Self {
        let mut bars = BTreeMap::new();
        bars.insert("BTCUSDT".to_string(), self::bars(60, 60_000.0));
        bars.insert("AAPL".to_string(), self::bars(60, 170.0));
        bars.insert("GC=F".to_string(), self::bars(60, 2_300.0));
        bars.insert("^VIX".to_string(), self::bars(30, 14.0));
        Self { bars }
    }
}

#[async_trait]
impl CryptoPriceSource for Market {
    async fn daily_klines(&self, pair: &str, _limit: usize) -> Result<Vec<PricePoint>, SourceError> {
        self.bars.get(pair).cloned().ok_or_else(|| missing(pair))
    }
}

#[async_trait]
impl DailyBarSource for Market {
    async fn daily_history(&self, symbol: &str, _range: &str) -> Result<Vec<PricePoint>, SourceError> {
        self.bars.get(symbol).cloned().ok_or_else(|| missing(symbol))
    }
}

#[async_trait]
impl MarketCapSource for Market {
    async fn market_cap_usd(&self, _coin_id: &str) -> Result<Option<f64>, SourceError> {
        Ok(Some(1.2e12))
    }
}

#[async_trait]
impl MacroSeriesSource for Market {
    async fn observations(
        &self,
        _series_id: &str,
        _start: NaiveDate,
    ) -> Result<Vec<(NaiveDate, f64)>, SourceError> {
        Ok((0..30)
            .map(|i| (run_date() - Duration::days(30 - i), 5_000.0 + i as f64))
            .collect())
    }
}

#[async_trait]
impl SentimentSource for Market {
    async fn recent(&self, limit: usize) -> Result<Vec<SentimentPoint>, SourceError> {
        Ok((0..10)
            .map(|i| SentimentPoint {
                date: run_date() - Duration::days(i),
                value: 40 + i as i32,
                classification: "Fear".to_string(),
            })
            .take(limit)
            .collect())
    }
}

/// Six dated crypto headlines with short blurbs, plus two AAPL stories.
pub struct Newsroom;

pub fn crypto_link(i: u32) -> String {
    format!("https://news.example/crypto/{}", i)
}

#[async_trait]
impl FeedSource for Newsroom {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>, SourceError> {
        if url != FEED_URL {
            return Err(missing(url));
        }
        Ok((0..6)
            .map(|i| FeedItem {
                title: format!("Crypto headline {}", i),
                link: crypto_link(i),
                description: "Short blurb".to_string(),
                published_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 1, i, 0).unwrap()),
            })
            .collect())
    }
}

#[async_trait]
impl EquityNewsSource for Newsroom {
    async fn news_for(&self, symbol: &str, limit: usize) -> Result<Vec<ArticleDraft>, SourceError> {
        Ok((0..2)
            .map(|i| ArticleDraft {
                url: format!("https://news.example/{}/{}", symbol, i),
                source: "Wire".to_string(),
                title: format!("{} story {}", symbol, i),
                summary: None,
                published_at: Utc.with_ymd_and_hms(2024, 5, 1, 2, i, 0).unwrap(),
                related_tickers: vec![symbol.to_string()],
            })
            .take(limit)
            .collect())
    }
}

#[async_trait]
impl ArticleScraper for Newsroom {
    async fn body_text(&self, url: &str) -> Result<String, SourceError> {
        Ok(format!("Full article text for {} with plenty of detail.", url))
    }
}

/// Answers each prompt kind with a well-formed reply and counts calls.
#[derive(Default)]
pub struct Analyst {
    calls: AtomicUsize,
}

impl Analyst {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for Analyst {
    async fn generate(&self, _model: &str, prompt: &str) -> Result<String, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if prompt.starts_with("Summarize each of these") {
            let count = prompt.matches("\nTitle: ").count();
            let items: Vec<String> = (0..count)
                .map(|i| format!("\"Summary {} covering the key market facts.\"", i))
                .collect();
            return Ok(format!("[{}]", items.join(",")));
        }
        if prompt.starts_with("You are the Chief Investment Officer") {
            return Ok(r#"{"top_news":[
                {"article_number":1,"importance_score":9},
                {"article_number":2,"importance_score":8},
                {"article_number":3,"importance_score":7},
                {"article_number":4,"importance_score":6},
                {"article_number":5,"importance_score":5}]}"#
                .to_string());
        }
        if prompt.starts_with("You are a Senior Financial Analyst") {
            return Ok(r#"{"trend_signal":"Neutral","key_levels":{"support":[1.0,2.0],"resistance":[3.0,4.0]},"summary_text":"Range bound."}"#.to_string());
        }
        if prompt.starts_with("You are a Senior Macroeconomic Analyst") {
            return Ok("Liquidity is steady and volatility is contained.".to_string());
        }
        if prompt.starts_with("Condense the following") {
            return Ok("Steady liquidity.".to_string());
        }
        Err(missing("unexpected prompt"))
    }
}

/// One crypto pair, one equity, one commodity, one FRED series and one feed,
/// with every pacing knob at zero.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.assets.crypto = vec![CryptoAssetConfig {
        pair: "BTCUSDT".to_string(),
        symbol: "BTC".to_string(),
        name: Some("Bitcoin".to_string()),
        coingecko_id: Some("bitcoin".to_string()),
    }];
    config.assets.equities = vec!["AAPL".to_string()];
    config.assets.commodities = vec!["GC=F".to_string()];
    config.assets.macro_series = BTreeMap::from([("sp500".to_string(), "SP500".to_string())]);
    config.assets.news_feeds = BTreeMap::from([("Example".to_string(), FEED_URL.to_string())]);
    config.scheduler.yahoo_spacing_secs = 0;
    config.scheduler.llm_spacing_secs = 0;
    config.enrichment.news_batch_pause_secs = 0;
    config.enrichment.analysis_interval_secs = 0;
    config.enrichment.macro_pause_secs = 0;
    config.logs.run_log_path = std::env::temp_dir()
        .join(format!("dipsignal-it-{}.jsonl", uuid::Uuid::new_v4()))
        .display()
        .to_string();
    config
}

pub struct Harness {
    pub warehouse: Arc<MemoryWarehouse>,
    pub llm: Arc<Analyst>,
    pub deps: PipelineDeps,
}

pub fn harness() -> Harness {
    let warehouse = Arc::new(MemoryWarehouse::new());
    let llm = Arc::new(Analyst::default());
    let market = Arc::new(Market::standard());
    let newsroom = Arc::new(Newsroom);
    let deps = PipelineDeps {
        warehouse: warehouse.clone(),
        crypto_prices: market.clone(),
        market_caps: market.clone(),
        bars: market.clone(),
        macro_series: market.clone(),
        sentiment: market,
        feeds: newsroom.clone(),
        equity_news: newsroom.clone(),
        scraper: newsroom,
        llm: llm.clone(),
        lock: Arc::new(LocalRunLock::new()),
    };
    Harness { warehouse, llm, deps }
}

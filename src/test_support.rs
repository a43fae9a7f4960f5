//! Scripted sources and helpers shared by unit tests.

use crate::cache::LocalRunLock;
use crate::database::memory::MemoryWarehouse;
use crate::database::models::{ArticleDraft, PricePoint, SentimentPoint};
use crate::error::SourceError;
use crate::processor::job::RunContext;
use crate::processor::pipeline::PipelineDeps;
use crate::sources::{
    ArticleScraper, CryptoPriceSource, DailyBarSource, EquityNewsSource, FeedItem, FeedSource,
    LanguageModel, MacroSeriesSource, MarketCapSource, SentimentSource,
};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// A Wednesday that is a regular US trading day.
pub fn trading_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
}

pub fn run_ctx() -> RunContext {
    run_ctx_on(trading_day())
}

pub fn run_ctx_on(date: NaiveDate) -> RunContext {
    RunContext::detached("test", date)
}

/// `n` consecutive calendar-day bars starting at `start`, each closing one
/// unit above the previous.
pub fn daily_bars(start: NaiveDate, n: usize, first_close: f64) -> Vec<PricePoint> {
    (0..n)
        .map(|i| {
            let close = first_close + i as f64;
            let ts = (start + Duration::days(i as i64)).and_time(NaiveTime::MIN).and_utc();
            PricePoint::daily(ts, close - 0.5, close + 1.0, close - 1.0, close, 1_000.0 + i as f64)
        })
        .collect()
}

fn failure(name: &str) -> SourceError {
    SourceError::Status {
        source_name: name.to_string(),
        status: 500,
    }
}

#[derive(Default)]
pub struct FixedCryptoPrices {
    bars: HashMap<String, Vec<PricePoint>>,
}

impl FixedCryptoPrices {
    pub fn with(mut self, pair: &str, bars: Vec<PricePoint>) -> Self {
        self.bars.insert(pair.to_string(), bars);
        self
    }
}

#[async_trait]
impl CryptoPriceSource for FixedCryptoPrices {
    async fn daily_klines(&self, pair: &str, _limit: usize) -> Result<Vec<PricePoint>, SourceError> {
        self.bars
            .get(pair)
            .cloned()
            .ok_or_else(|| SourceError::Empty(pair.to_string()))
    }
}

#[derive(Default)]
pub struct FixedMarketCaps {
    caps: HashMap<String, f64>,
}

impl FixedMarketCaps {
    pub fn with(mut self, coin_id: &str, cap: f64) -> Self {
        self.caps.insert(coin_id.to_string(), cap);
        self
    }
}

#[async_trait]
impl MarketCapSource for FixedMarketCaps {
    async fn market_cap_usd(&self, coin_id: &str) -> Result<Option<f64>, SourceError> {
        Ok(self.caps.get(coin_id).copied())
    }
}

#[derive(Default)]
pub struct FixedBars {
    bars: HashMap<String, Vec<PricePoint>>,
    requested: Mutex<Vec<String>>,
}

impl FixedBars {
    pub fn with(mut self, symbol: &str, bars: Vec<PricePoint>) -> Self {
        self.bars.insert(symbol.to_string(), bars);
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl DailyBarSource for FixedBars {
    async fn daily_history(&self, symbol: &str, _range: &str) -> Result<Vec<PricePoint>, SourceError> {
        self.requested.lock().push(symbol.to_string());
        self.bars
            .get(symbol)
            .cloned()
            .ok_or_else(|| SourceError::Empty(symbol.to_string()))
    }
}

#[derive(Default)]
pub struct FixedMacroSeries {
    series: HashMap<String, Vec<(NaiveDate, f64)>>,
    failing: BTreeSet<String>,
}

impl FixedMacroSeries {
    pub fn with(mut self, series_id: &str, points: Vec<(NaiveDate, f64)>) -> Self {
        self.series.insert(series_id.to_string(), points);
        self
    }

    pub fn failing(mut self, series_id: &str) -> Self {
        self.failing.insert(series_id.to_string());
        self
    }
}

#[async_trait]
impl MacroSeriesSource for FixedMacroSeries {
    async fn observations(
        &self,
        series_id: &str,
        start: NaiveDate,
    ) -> Result<Vec<(NaiveDate, f64)>, SourceError> {
        if self.failing.contains(series_id) {
            return Err(failure("fred"));
        }
        Ok(self
            .series
            .get(series_id)
            .map(|points| points.iter().filter(|(d, _)| *d >= start).copied().collect())
            .unwrap_or_default())
    }
}

pub struct FixedSentiment(pub Vec<SentimentPoint>);

#[async_trait]
impl SentimentSource for FixedSentiment {
    async fn recent(&self, limit: usize) -> Result<Vec<SentimentPoint>, SourceError> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}

#[derive(Default)]
pub struct FixedFeeds {
    feeds: HashMap<String, Vec<FeedItem>>,
    failing: BTreeSet<String>,
}

impl FixedFeeds {
    pub fn with(mut self, url: &str, items: Vec<FeedItem>) -> Self {
        self.feeds.insert(url.to_string(), items);
        self
    }

    pub fn failing(mut self, url: &str) -> Self {
        self.failing.insert(url.to_string());
        self
    }
}

#[async_trait]
impl FeedSource for FixedFeeds {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>, SourceError> {
        if self.failing.contains(url) {
            return Err(failure(url));
        }
        Ok(self.feeds.get(url).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct FixedEquityNews {
    news: HashMap<String, Vec<ArticleDraft>>,
}

impl FixedEquityNews {
    pub fn with(mut self, symbol: &str, drafts: Vec<ArticleDraft>) -> Self {
        self.news.insert(symbol.to_string(), drafts);
        self
    }
}

#[async_trait]
impl EquityNewsSource for FixedEquityNews {
    async fn news_for(&self, symbol: &str, limit: usize) -> Result<Vec<ArticleDraft>, SourceError> {
        self.news
            .get(symbol)
            .map(|drafts| drafts.iter().take(limit).cloned().collect())
            .ok_or_else(|| failure("yahoo"))
    }
}

/// Returns canned page text; unknown URLs fail like an unreachable page.
#[derive(Default)]
pub struct FixedScraper {
    pages: HashMap<String, String>,
}

impl FixedScraper {
    pub fn with(mut self, url: &str, text: &str) -> Self {
        self.pages.insert(url.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl ArticleScraper for FixedScraper {
    async fn body_text(&self, url: &str) -> Result<String, SourceError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| SourceError::Empty(url.to_string()))
    }
}

type Responder = Box<dyn Fn(&str, &str) -> Result<String, SourceError> + Send + Sync>;

/// Language model that replays queued replies, or answers through a
/// closure once the queue is drained. Every prompt is recorded.
pub struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, SourceError>>>,
    responder: Option<Responder>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedLlm {
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(|r| Ok(r.into())).collect()),
            responder: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn responder<F>(f: F) -> Self
    where
        F: Fn(&str, &str) -> Result<String, SourceError> + Send + Sync + 'static,
    {
        Self {
            replies: Mutex::new(VecDeque::new()),
            responder: Some(Box::new(f)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn then_fail(self) -> Self {
        self.replies.lock().push_back(Err(failure("gemini")));
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, SourceError> {
        self.prompts.lock().push((model.to_string(), prompt.to_string()));
        if let Some(reply) = self.replies.lock().pop_front() {
            return reply;
        }
        match &self.responder {
            Some(f) => f(model, prompt),
            None => Err(SourceError::Empty("no scripted reply".to_string())),
        }
    }
}

/// Pipeline wiring over an empty in-memory warehouse and silent sources.
pub fn fake_deps() -> PipelineDeps {
    PipelineDeps {
        warehouse: Arc::new(MemoryWarehouse::new()),
        crypto_prices: Arc::new(FixedCryptoPrices::default()),
        market_caps: Arc::new(FixedMarketCaps::default()),
        bars: Arc::new(FixedBars::default()),
        macro_series: Arc::new(FixedMacroSeries::default()),
        sentiment: Arc::new(FixedSentiment(vec![])),
        feeds: Arc::new(FixedFeeds::default()),
        equity_news: Arc::new(FixedEquityNews::default()),
        scraper: Arc::new(FixedScraper::default()),
        llm: Arc::new(ScriptedLlm::replies(Vec::<String>::new())),
        lock: Arc::new(LocalRunLock::new()),
    }
}

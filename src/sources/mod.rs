//! Clients for the external market-data, news and language-model APIs.
//!
//! Each concern is a small trait so adapters and stages can be driven by
//! scripted fakes in tests; the `reqwest` implementations live in the
//! per-vendor modules.

pub mod binance;
pub mod coingecko;
pub mod fear_greed;
pub mod fred;
pub mod llm;
pub mod pacing;
pub mod retry;
pub mod rss;
pub mod scrape;
pub mod yahoo;

use crate::config::HttpConfig;
use crate::database::models::{ArticleDraft, PricePoint, SentimentPoint};
use crate::error::SourceError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

pub use self::llm::LanguageModel;
pub use self::pacing::Pacer;
pub use self::retry::{retry_with_backoff, BackoffPolicy};

/// Daily crypto candles from the exchange.
#[async_trait]
pub trait CryptoPriceSource: Send + Sync {
    async fn daily_klines(&self, pair: &str, limit: usize) -> Result<Vec<PricePoint>, SourceError>;
}

#[async_trait]
pub trait MarketCapSource: Send + Sync {
    async fn market_cap_usd(&self, coin_id: &str) -> Result<Option<f64>, SourceError>;
}

/// Daily bars for equities, commodities and index tickers.
#[async_trait]
pub trait DailyBarSource: Send + Sync {
    async fn daily_history(&self, symbol: &str, range: &str)
        -> Result<Vec<PricePoint>, SourceError>;
}

/// Economic time series (date, value), oldest first.
#[async_trait]
pub trait MacroSeriesSource: Send + Sync {
    async fn observations(
        &self,
        series_id: &str,
        start: NaiveDate,
    ) -> Result<Vec<(NaiveDate, f64)>, SourceError>;
}

#[async_trait]
pub trait SentimentSource: Send + Sync {
    async fn recent(&self, limit: usize) -> Result<Vec<SentimentPoint>, SourceError>;
}

/// One entry of a syndication feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_feed(&self, url: &str) -> Result<Vec<FeedItem>, SourceError>;
}

#[async_trait]
pub trait EquityNewsSource: Send + Sync {
    async fn news_for(&self, symbol: &str, limit: usize)
        -> Result<Vec<ArticleDraft>, SourceError>;
}

/// Fetches the readable body text of an article page.
#[async_trait]
pub trait ArticleScraper: Send + Sync {
    async fn body_text(&self, url: &str) -> Result<String, SourceError>;
}

/// Shared HTTP client with the pipeline-wide timeout.
pub fn http_client(config: &HttpConfig) -> Result<Client, SourceError> {
    Ok(Client::builder()
        .timeout(config.timeout())
        .user_agent(config.user_agent.clone())
        .build()?)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Sends a request and maps HTTP status codes onto `SourceError`.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    source_name: &str,
) -> Result<reqwest::Response, SourceError> {
    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            SourceError::Timeout(source_name.to_string())
        } else {
            SourceError::Http(e)
        }
    })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(SourceError::RateLimited {
            source_name: source_name.to_string(),
            retry_after: retry_after(&response),
        });
    }
    if !status.is_success() {
        return Err(SourceError::Status {
            source_name: source_name.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

pub(crate) async fn get_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
    source_name: &str,
) -> Result<T, SourceError> {
    let body = send(request, source_name).await?.text().await?;
    serde_json::from_str(&body)
        .map_err(|e| SourceError::Malformed(format!("{}: {}", source_name, e)))
}

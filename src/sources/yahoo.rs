use crate::database::models::{ArticleDraft, PricePoint};
use crate::error::SourceError;
use crate::sources::{send, DailyBarSource, EquityNewsSource};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use reqwest::Client;
use serde::Deserialize;

pub const YAHOO_CHART_URL: &str = "https://query1.finance.yahoo.com";
pub const YAHOO_SEARCH_URL: &str = "https://query2.finance.yahoo.com";

/// Share classes use '-' instead of '.' (BRK.B -> BRK-B).
pub fn yahoo_symbol(symbol: &str) -> String {
    symbol.replace('.', "-")
}

pub struct YahooClient {
    client: Client,
    chart_url: String,
    search_url: String,
}

impl YahooClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            chart_url: YAHOO_CHART_URL.to_string(),
            search_url: YAHOO_SEARCH_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: ChartIndicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(default)]
    gmtoffset: i64,
}

#[derive(Debug, Deserialize)]
struct ChartIndicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Default, Deserialize)]
struct Quote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Converts a chart payload into daily bars keyed at midnight UTC of the
/// exchange-local trading date, so re-fetches produce identical keys.
/// Rows with any missing price are dropped.
pub fn parse_chart(body: &str) -> Result<Vec<PricePoint>, SourceError> {
    let envelope: ChartEnvelope = serde_json::from_str(body)
        .map_err(|e| SourceError::Malformed(format!("yahoo chart: {}", e)))?;
    if let Some(err) = envelope.chart.error.filter(|e| !e.is_null()) {
        return Err(SourceError::Malformed(format!("yahoo chart error: {}", err)));
    }
    let result = envelope
        .chart
        .result
        .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
        .ok_or_else(|| SourceError::Malformed("yahoo chart has no result".to_string()))?;

    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let offset = Duration::seconds(result.meta.gmtoffset);

    let mut bars = Vec::with_capacity(result.timestamp.len());
    for (i, ts) in result.timestamp.iter().enumerate() {
        let at = |series: &Vec<Option<f64>>| series.get(i).copied().flatten();
        let (Some(open), Some(high), Some(low), Some(close)) =
            (at(&quote.open), at(&quote.high), at(&quote.low), at(&quote.close))
        else {
            continue;
        };
        let Some(instant) = DateTime::<Utc>::from_timestamp(*ts, 0) else {
            continue;
        };
        let local_date = (instant + offset).date_naive();
        let timestamp = local_date.and_time(NaiveTime::MIN).and_utc();
        // Index tickers report no volume.
        let volume = at(&quote.volume).unwrap_or(0.0).max(0.0);
        bars.push(PricePoint::daily(timestamp, open, high, low, close, volume));
    }
    bars.dedup_by_key(|b| b.timestamp);
    Ok(bars)
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    news: Vec<SearchNews>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchNews {
    title: Option<String>,
    link: Option<String>,
    publisher: Option<String>,
    provider_publish_time: Option<i64>,
    #[serde(default)]
    related_tickers: Vec<String>,
}

/// Converts search news into drafts. Articles without title, link or publish
/// time are dropped; tags default to the queried symbol.
pub fn parse_news(body: &str, symbol: &str, limit: usize) -> Result<Vec<ArticleDraft>, SourceError> {
    let envelope: SearchEnvelope = serde_json::from_str(body)
        .map_err(|e| SourceError::Malformed(format!("yahoo search: {}", e)))?;

    Ok(envelope
        .news
        .into_iter()
        .filter_map(|item| {
            let title = item.title.filter(|t| !t.trim().is_empty())?;
            let url = item.link.filter(|l| !l.trim().is_empty())?;
            let published_at = DateTime::<Utc>::from_timestamp(item.provider_publish_time?, 0)?;
            let related_tickers = if item.related_tickers.is_empty() {
                vec![symbol.to_string()]
            } else {
                item.related_tickers
            };
            Some(ArticleDraft {
                url,
                source: item.publisher.unwrap_or_else(|| "Yahoo Finance".to_string()),
                title: title.trim().to_string(),
                summary: None,
                published_at,
                related_tickers,
            })
        })
        .take(limit)
        .collect())
}

#[async_trait]
impl DailyBarSource for YahooClient {
    async fn daily_history(
        &self,
        symbol: &str,
        range: &str,
    ) -> Result<Vec<PricePoint>, SourceError> {
        let url = format!("{}/v8/finance/chart/{}", self.chart_url, symbol);
        let request = self
            .client
            .get(url)
            .query(&[("range", range), ("interval", "1d"), ("events", "div,split")]);
        let body = send(request, "yahoo").await?.text().await?;
        let bars = parse_chart(&body)?;
        if bars.is_empty() {
            return Err(SourceError::Empty(symbol.to_string()));
        }
        Ok(bars)
    }
}

#[async_trait]
impl EquityNewsSource for YahooClient {
    async fn news_for(&self, symbol: &str, limit: usize) -> Result<Vec<ArticleDraft>, SourceError> {
        let url = format!("{}/v1/finance/search", self.search_url);
        let request = self.client.get(url).query(&[
            ("q", symbol),
            ("newsCount", &limit.to_string()),
            ("quotesCount", "0"),
        ]);
        let body = send(request, "yahoo").await?.text().await?;
        parse_news(&body, symbol, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHART: &str = r#"{"chart":{"result":[{"meta":{"gmtoffset":-14400},
        "timestamp":[1714570200,1714656600,1714743000],
        "indicators":{"quote":[{"open":[10.0,11.0,null],"high":[12.0,12.5,13.0],
        "low":[9.5,10.5,11.0],"close":[11.0,12.0,12.5],"volume":[100,null,300]}]}}],"error":null}}"#;

    #[test]
    fn chart_bars_keyed_by_local_date() {
        let bars = parse_chart(CHART).unwrap();
        // third row has a null open and is dropped
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp.to_rfc3339(), "2024-05-01T00:00:00+00:00");
        assert_eq!(bars[1].timestamp.to_rfc3339(), "2024-05-02T00:00:00+00:00");
        assert_eq!(bars[1].volume, 0.0);
    }

    #[test]
    fn chart_error_is_malformed() {
        let body = r#"{"chart":{"result":null,"error":{"code":"Not Found"}}}"#;
        assert!(matches!(parse_chart(body), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn news_defaults_tags_to_symbol() {
        let body = r#"{"news":[
            {"title":"Apple beats","link":"https://x/a","publisher":"Reuters","providerPublishTime":1714570200},
            {"title":"Chips rally","link":"https://x/b","providerPublishTime":1714570300,"relatedTickers":["NVDA","AMD"]},
            {"title":"","link":"https://x/c","providerPublishTime":1714570400}
        ]}"#;
        let drafts = parse_news(body, "AAPL", 5).unwrap();
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].related_tickers, vec!["AAPL"]);
        assert_eq!(drafts[0].source, "Reuters");
        assert_eq!(drafts[1].related_tickers, vec!["NVDA", "AMD"]);
    }

    #[test]
    fn share_class_symbols() {
        assert_eq!(yahoo_symbol("BRK.B"), "BRK-B");
        assert_eq!(yahoo_symbol("GC=F"), "GC=F");
    }
}

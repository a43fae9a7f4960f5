use crate::error::SourceError;
use crate::sources::{get_json, MarketCapSource};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

pub const COINGECKO_BASE_URL: &str = "https://api.coingecko.com";

pub struct CoinGeckoClient {
    client: Client,
    base_url: String,
}

impl CoinGeckoClient {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, COINGECKO_BASE_URL)
    }

    pub fn with_base_url(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Extracts `market_data.market_cap.usd` from a coin payload.
pub fn market_cap_from(payload: &Value) -> Option<f64> {
    payload
        .pointer("/market_data/market_cap/usd")
        .and_then(Value::as_f64)
        .filter(|cap| *cap > 0.0)
}

#[async_trait]
impl MarketCapSource for CoinGeckoClient {
    async fn market_cap_usd(&self, coin_id: &str) -> Result<Option<f64>, SourceError> {
        let url = format!("{}/api/v3/coins/{}", self.base_url, coin_id);
        let request = self.client.get(url).query(&[
            ("localization", "false"),
            ("tickers", "false"),
            ("community_data", "false"),
            ("developer_data", "false"),
        ]);
        let payload: Value = get_json(request, "coingecko").await?;
        Ok(market_cap_from(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_usd_market_cap() {
        let payload = json!({"market_data": {"market_cap": {"usd": 1.2e12, "eur": 1.1e12}}});
        assert_eq!(market_cap_from(&payload), Some(1.2e12));
        assert_eq!(market_cap_from(&json!({"market_data": {}})), None);
        assert_eq!(market_cap_from(&json!({"market_data": {"market_cap": {"usd": 0}}})), None);
    }
}

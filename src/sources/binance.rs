use crate::database::models::PricePoint;
use crate::error::SourceError;
use crate::sources::{get_json, CryptoPriceSource};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde_json::Value;

pub const BINANCE_BASE_URL: &str = "https://api.binance.com";

pub struct BinanceClient {
    client: Client,
    base_url: String,
}

impl BinanceClient {
    pub fn new(client: Client) -> Self {
        Self::with_base_url(client, BINANCE_BASE_URL)
    }

    pub fn with_base_url(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

fn number(value: Option<&Value>, field: &str) -> Result<f64, SourceError> {
    match value {
        Some(Value::String(s)) => s
            .parse::<f64>()
            .map_err(|_| SourceError::Malformed(format!("kline {} '{}' is not numeric", field, s))),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| SourceError::Malformed(format!("kline {} out of range", field))),
        _ => Err(SourceError::Malformed(format!("kline {} missing", field))),
    }
}

/// Parses the exchange's array-of-arrays kline payload. Open times are
/// epoch milliseconds in UTC.
pub fn parse_klines(payload: &Value) -> Result<Vec<PricePoint>, SourceError> {
    let rows = payload
        .as_array()
        .ok_or_else(|| SourceError::Malformed("klines payload is not an array".to_string()))?;

    rows.iter()
        .map(|row| {
            let open_time = row
                .get(0)
                .and_then(Value::as_i64)
                .ok_or_else(|| SourceError::Malformed("kline open time missing".to_string()))?;
            let timestamp = DateTime::from_timestamp_millis(open_time).ok_or_else(|| {
                SourceError::Malformed(format!("kline open time {} out of range", open_time))
            })?;
            let field = |idx: usize, name: &str| number(row.get(idx), name);
            Ok(PricePoint::daily(
                timestamp,
                field(1, "open")?,
                field(2, "high")?,
                field(3, "low")?,
                field(4, "close")?,
                field(5, "volume")?,
            ))
        })
        .collect()
}

#[async_trait]
impl CryptoPriceSource for BinanceClient {
    async fn daily_klines(&self, pair: &str, limit: usize) -> Result<Vec<PricePoint>, SourceError> {
        let url = format!("{}/api/v3/klines", self.base_url);
        let request = self.client.get(url).query(&[
            ("symbol", pair),
            ("interval", "1d"),
            ("limit", &limit.to_string()),
        ]);
        let payload: Value = get_json(request, "binance").await?;
        let bars = parse_klines(&payload)?;
        if bars.is_empty() {
            return Err(SourceError::Empty(pair.to_string()));
        }
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kline_rows() {
        let payload = json!([
            [1714521600000i64, "60000.1", "61000.0", "59000.5", "60500.0", "1234.5", 1714607999999i64, "0", 100, "0", "0", "0"],
            [1714608000000i64, "60500.0", "62000.0", "60000.0", "61800.0", "999.0", 1714694399999i64, "0", 100, "0", "0", "0"]
        ]);
        let bars = parse_klines(&payload).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp.to_rfc3339(), "2024-05-01T00:00:00+00:00");
        assert_eq!(bars[0].open, 60000.1);
        assert_eq!(bars[1].close, 61800.0);
        assert_eq!(bars[1].interval, "1d");
    }

    #[test]
    fn rejects_non_numeric_prices() {
        let payload = json!([[1714521600000i64, "abc", "1", "1", "1", "1"]]);
        assert!(matches!(parse_klines(&payload), Err(SourceError::Malformed(_))));
    }
}

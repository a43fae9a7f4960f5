use crate::database::models::SentimentPoint;
use crate::error::SourceError;
use crate::sources::{get_json, SentimentSource};
use async_trait::async_trait;
use chrono::DateTime;
use reqwest::Client;
use serde::Deserialize;

pub const FEAR_GREED_URL: &str = "https://api.alternative.me/fng/";

pub struct FearGreedClient {
    client: Client,
    url: String,
}

impl FearGreedClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            url: FEAR_GREED_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FearGreedPayload {
    #[serde(default)]
    data: Vec<FearGreedEntry>,
}

#[derive(Debug, Deserialize)]
struct FearGreedEntry {
    value: String,
    value_classification: String,
    timestamp: String,
}

impl FearGreedPayload {
    /// Converts entries to points ordered oldest first. The API quotes every
    /// number as a string; timestamps are epoch seconds.
    pub fn into_points(self) -> Result<Vec<SentimentPoint>, SourceError> {
        let mut points = self
            .data
            .into_iter()
            .map(|entry| {
                let seconds: i64 = entry.timestamp.trim().parse().map_err(|_| {
                    SourceError::Malformed(format!("fgi timestamp '{}'", entry.timestamp))
                })?;
                let date = DateTime::from_timestamp(seconds, 0)
                    .ok_or_else(|| SourceError::Malformed(format!("fgi timestamp {}", seconds)))?
                    .date_naive();
                let value: i32 = entry
                    .value
                    .trim()
                    .parse()
                    .map_err(|_| SourceError::Malformed(format!("fgi value '{}'", entry.value)))?;
                Ok(SentimentPoint {
                    date,
                    value,
                    classification: entry.value_classification,
                })
            })
            .collect::<Result<Vec<_>, SourceError>>()?;
        points.sort_by_key(|p| p.date);
        Ok(points)
    }
}

#[async_trait]
impl SentimentSource for FearGreedClient {
    async fn recent(&self, limit: usize) -> Result<Vec<SentimentPoint>, SourceError> {
        let request = self
            .client
            .get(&self.url)
            .query(&[("limit", limit.to_string())]);
        let payload: FearGreedPayload = get_json(request, "fear_greed").await?;
        let points = payload.into_points()?;
        if points.is_empty() {
            return Err(SourceError::Empty("fear & greed index".to_string()));
        }
        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_epoch_seconds_to_dates() {
        let payload: FearGreedPayload = serde_json::from_str(
            r#"{"name":"Fear and Greed Index","data":[
                {"value":"72","value_classification":"Greed","timestamp":"1714608000"},
                {"value":"40","value_classification":"Fear","timestamp":"1714521600"}
            ]}"#,
        )
        .unwrap();
        let points = payload.into_points().unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date.to_string(), "2024-05-01");
        assert_eq!(points[0].value, 40);
        assert_eq!(points[1].classification, "Greed");
    }

    #[test]
    fn rejects_non_numeric_value() {
        let payload: FearGreedPayload = serde_json::from_str(
            r#"{"data":[{"value":"n/a","value_classification":"?","timestamp":"1714608000"}]}"#,
        )
        .unwrap();
        assert!(payload.into_points().is_err());
    }
}

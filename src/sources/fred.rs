use crate::error::SourceError;
use crate::sources::{send, MacroSeriesSource};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;

pub const FRED_BASE_URL: &str = "https://api.stlouisfed.org";

pub struct FredClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl FredClient {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: FRED_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObservationsEnvelope {
    observations: Vec<Observation>,
}

#[derive(Debug, Deserialize)]
struct Observation {
    date: String,
    value: String,
}

/// Parses an observations payload. FRED reports missing values as ".",
/// those rows are omitted.
pub fn parse_observations(body: &str) -> Result<Vec<(NaiveDate, f64)>, SourceError> {
    let envelope: ObservationsEnvelope = serde_json::from_str(body)
        .map_err(|e| SourceError::Malformed(format!("fred: {}", e)))?;

    let mut points = Vec::with_capacity(envelope.observations.len());
    for obs in envelope.observations {
        let date = NaiveDate::parse_from_str(&obs.date, "%Y-%m-%d")
            .map_err(|_| SourceError::Malformed(format!("fred date '{}'", obs.date)))?;
        if obs.value.trim() == "." {
            continue;
        }
        let value = obs
            .value
            .trim()
            .parse::<f64>()
            .map_err(|_| SourceError::Malformed(format!("fred value '{}'", obs.value)))?;
        points.push((date, value));
    }
    points.sort_by_key(|(date, _)| *date);
    Ok(points)
}

#[async_trait]
impl MacroSeriesSource for FredClient {
    async fn observations(
        &self,
        series_id: &str,
        start: NaiveDate,
    ) -> Result<Vec<(NaiveDate, f64)>, SourceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(SourceError::MissingCredential("FRED_API_KEY"))?;
        let start = start.format("%Y-%m-%d").to_string();
        let request = self
            .client
            .get(format!("{}/fred/series/observations", self.base_url))
            .query(&[
                ("series_id", series_id),
                ("api_key", api_key),
                ("file_type", "json"),
                ("observation_start", start.as_str()),
            ]);
        let body = send(request, "fred").await?.text().await?;
        parse_observations(&body)
    }
}

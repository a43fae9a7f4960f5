//! Fetch adapters: one per pipeline data-collection node.
//!
//! Adapters record per-identifier failures in their [`FetchReport`] and keep
//! going; only storage failures abort the adapter run.

pub mod crypto_news;
pub mod crypto_prices;
pub mod equity_news;
pub mod macro_data;
pub mod sentiment;
pub mod yahoo_prices;

use crate::database::models::PricePoint;
use crate::error::NodeError;
use crate::processor::job::RunContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::warn;

pub use self::crypto_news::CryptoNewsCollector;
pub use self::crypto_prices::CryptoPriceCollector;
pub use self::equity_news::EquityNewsCollector;
pub use self::macro_data::MacroCollector;
pub use self::sentiment::SentimentCollector;
pub use self::yahoo_prices::YahooPriceCollector;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchReport {
    pub records_written: u64,
    /// `identifier: reason` for every skipped item.
    pub errors: Vec<String>,
}

impl FetchReport {
    pub fn record_error(&mut self, identifier: &str, reason: impl Display) {
        warn!("{}: {}", identifier, reason);
        self.errors.push(format!("{}: {}", identifier, reason));
    }
}

#[async_trait]
pub trait FetchAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError>;
}

/// Drops bars that violate the OHLCV invariants, recording each one.
pub fn keep_valid_bars(
    identifier: &str,
    bars: Vec<PricePoint>,
    report: &mut FetchReport,
) -> Vec<PricePoint> {
    bars.into_iter()
        .filter(|bar| match bar.validate() {
            Ok(()) => true,
            Err(reason) => {
                report.record_error(identifier, reason);
                false
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn invalid_bars_are_counted() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let bars = vec![
            PricePoint::daily(ts, 10.0, 11.0, 9.0, 10.5, 100.0),
            // high below close
            PricePoint::daily(ts, 10.0, 10.2, 9.0, 10.5, 100.0),
        ];
        let mut report = FetchReport::default();
        let kept = keep_valid_bars("AAPL", bars, &mut report);
        assert_eq!(kept.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("AAPL: high"));
    }
}

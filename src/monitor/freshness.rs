use crate::database::models::MonitoredTable;
use crate::database::warehouse::{StorageResult, Warehouse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

pub const FRESH_HOURS: f64 = 24.0;
pub const CRITICAL_HOURS: f64 = 72.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessStatus {
    Fresh,
    Stale,
    Critical,
}

impl FreshnessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FreshnessStatus::Fresh => "fresh",
            FreshnessStatus::Stale => "stale",
            FreshnessStatus::Critical => "critical",
        }
    }

    pub fn from_hours(hours: f64) -> Self {
        if hours < FRESH_HOURS {
            FreshnessStatus::Fresh
        } else if hours < CRITICAL_HOURS {
            FreshnessStatus::Stale
        } else {
            FreshnessStatus::Critical
        }
    }
}

impl fmt::Display for FreshnessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Freshness of one monitored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessReport {
    pub table: MonitoredTable,
    pub table_name: String,
    pub latest_timestamp: Option<DateTime<Utc>>,
    /// `None` when the table has no rows.
    pub hours_since_last_update: Option<f64>,
    pub status: FreshnessStatus,
}

impl FreshnessReport {
    pub fn classify(table: MonitoredTable, latest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        let (hours, status) = classify(latest, now);
        Self {
            table,
            table_name: table.table_name().to_string(),
            latest_timestamp: latest,
            hours_since_last_update: hours,
            status,
        }
    }
}

/// Hours since `latest` and the resulting status. A timestamp in the future
/// counts as zero hours old.
pub fn classify(latest: Option<DateTime<Utc>>, now: DateTime<Utc>) -> (Option<f64>, FreshnessStatus) {
    match latest {
        None => (None, FreshnessStatus::Critical),
        Some(ts) => {
            let hours = (now - ts).num_seconds().max(0) as f64 / 3600.0;
            let status = FreshnessStatus::from_hours(hours);
            // Reported to one decimal place; classified on the exact value.
            (Some((hours * 10.0).round() / 10.0), status)
        }
    }
}

/// Freshness for every monitored table, in declaration order.
pub async fn check_freshness(
    warehouse: &dyn Warehouse,
    now: DateTime<Utc>,
) -> StorageResult<Vec<FreshnessReport>> {
    let mut reports = Vec::with_capacity(MonitoredTable::ALL.len());
    for table in MonitoredTable::ALL {
        let latest = warehouse.latest_timestamp(table).await?;
        let report = FreshnessReport::classify(table, latest, now);
        match report.status {
            FreshnessStatus::Fresh => debug!("{} is fresh", report.table_name),
            FreshnessStatus::Stale | FreshnessStatus::Critical => warn!(
                "{} is {} (last update: {})",
                report.table_name,
                report.status,
                latest.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
            ),
        }
        reports.push(report);
    }
    Ok(reports)
}

/// Worst status across `reports`; `Fresh` for an empty slice.
pub fn overall_status(reports: &[FreshnessReport]) -> FreshnessStatus {
    reports
        .iter()
        .map(|r| r.status)
        .max()
        .unwrap_or(FreshnessStatus::Fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::{PricePoint, SentimentPoint};
    use crate::database::{MemoryWarehouse, Warehouse};
    use crate::database::models::AssetClass;
    use chrono::{Duration, NaiveDate, TimeZone};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn thresholds() {
        let at = |h: i64| classify(Some(now() - Duration::hours(h)), now()).1;
        assert_eq!(at(10), FreshnessStatus::Fresh);
        assert_eq!(at(50), FreshnessStatus::Stale);
        assert_eq!(at(100), FreshnessStatus::Critical);
        assert_eq!(at(24), FreshnessStatus::Stale);
        assert_eq!(at(72), FreshnessStatus::Critical);
        assert_eq!(classify(None, now()), (None, FreshnessStatus::Critical));
    }

    #[test]
    fn future_timestamps_are_fresh() {
        let (hours, status) = classify(Some(now() + Duration::hours(3)), now());
        assert_eq!(hours, Some(0.0));
        assert_eq!(status, FreshnessStatus::Fresh);
    }

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(serde_json::to_string(&FreshnessStatus::Stale).unwrap(), "\"stale\"");
    }

    #[tokio::test]
    async fn reports_every_table() {
        let warehouse = MemoryWarehouse::new();
        let asset = warehouse
            .get_or_create_asset("BTC", AssetClass::Crypto, "Bitcoin")
            .await
            .unwrap();
        let bar = PricePoint::daily(now() - Duration::hours(5), 1.0, 2.0, 0.5, 1.5, 10.0);
        warehouse.insert_prices(asset.asset_id, &[bar]).await.unwrap();
        warehouse
            .insert_sentiment(&[SentimentPoint {
                date: NaiveDate::from_ymd_opt(2025, 3, 8).unwrap(),
                value: 40,
                classification: "Fear".into(),
            }])
            .await
            .unwrap();

        let reports = check_freshness(&warehouse, now()).await.unwrap();
        assert_eq!(reports.len(), MonitoredTable::ALL.len());
        let status = |t: MonitoredTable| reports.iter().find(|r| r.table == t).unwrap().status;
        assert_eq!(status(MonitoredTable::AssetPrices), FreshnessStatus::Fresh);
        // Midnight on the 8th is 60 hours before noon on the 10th.
        assert_eq!(status(MonitoredTable::SentimentIndex), FreshnessStatus::Stale);
        assert_eq!(status(MonitoredTable::TopNews), FreshnessStatus::Critical);
        assert_eq!(overall_status(&reports), FreshnessStatus::Critical);
    }

    proptest! {
        #[test]
        fn older_is_never_fresher(a in 0i64..500_000, b in 0i64..500_000) {
            let (younger, older) = if a <= b { (a, b) } else { (b, a) };
            let s1 = classify(Some(now() - Duration::seconds(younger)), now()).1;
            let s2 = classify(Some(now() - Duration::seconds(older)), now()).1;
            prop_assert!(s1 <= s2);
        }
    }
}

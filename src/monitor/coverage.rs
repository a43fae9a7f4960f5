use crate::database::models::{AssetClass, CoverageRow, MonitoredTable};
use crate::database::warehouse::{StorageResult, Warehouse};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Share of each asset class with a price bar on `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub date: NaiveDate,
    pub classes: Vec<ClassCoverage>,
    pub total_assets: i64,
    pub assets_with_data: i64,
    /// 0.0 to 1.0; 0.0 when there are no assets at all.
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassCoverage {
    pub asset_class: AssetClass,
    pub total_assets: i64,
    pub assets_with_data: i64,
    pub fraction: f64,
}

fn fraction(with_data: i64, total: i64) -> f64 {
    if total <= 0 {
        0.0
    } else {
        (with_data.clamp(0, total) as f64) / (total as f64)
    }
}

impl CoverageReport {
    pub fn from_rows(date: NaiveDate, rows: &[CoverageRow]) -> Self {
        let classes: Vec<ClassCoverage> = rows
            .iter()
            .map(|row| ClassCoverage {
                asset_class: row.asset_class,
                total_assets: row.total_assets,
                assets_with_data: row.assets_with_data,
                fraction: fraction(row.assets_with_data, row.total_assets),
            })
            .collect();
        let total_assets = rows.iter().map(|r| r.total_assets).sum();
        let assets_with_data = rows.iter().map(|r| r.assets_with_data).sum();
        Self {
            date,
            classes,
            total_assets,
            assets_with_data,
            fraction: fraction(assets_with_data, total_assets),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_assets > 0 && self.assets_with_data >= self.total_assets
    }

    pub fn percent(&self) -> i32 {
        (self.fraction * 100.0).round() as i32
    }
}

pub async fn check_coverage(warehouse: &dyn Warehouse, date: NaiveDate) -> StorageResult<CoverageReport> {
    let rows = warehouse.asset_coverage(date).await?;
    let report = CoverageReport::from_rows(date, &rows);
    info!(
        "Coverage for {}: {}/{} assets ({}%)",
        date,
        report.assets_with_data,
        report.total_assets,
        report.percent()
    );
    Ok(report)
}

/// Row count per monitored table.
pub async fn table_counts(warehouse: &dyn Warehouse) -> StorageResult<Vec<(MonitoredTable, i64)>> {
    let mut counts = Vec::with_capacity(MonitoredTable::ALL.len());
    for table in MonitoredTable::ALL {
        counts.push((table, warehouse.row_count(table).await?));
    }
    Ok(counts)
}

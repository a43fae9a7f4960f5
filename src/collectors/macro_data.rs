use crate::collectors::{FetchAdapter, FetchReport};
use crate::database::models::{MacroColumn, MacroIndicatorRow};
use crate::database::warehouse::SharedWarehouse;
use crate::error::NodeError;
use crate::processor::job::RunContext;
use crate::sources::{retry_with_backoff, BackoffPolicy, DailyBarSource, MacroSeriesSource};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, instrument};

/// Index tickers read from the chart API alongside the FRED series.
pub const MARKET_SERIES: [(&str, MacroColumn); 3] = [
    ("DX-Y.NYB", MacroColumn::Dxy),
    ("^VIX", MacroColumn::Vix),
    ("^TNX", MacroColumn::Treasury10y),
];

/// Columns whose joint absence marks a day as market-closed. Monthly and
/// quarterly series are excluded since they are missing most days anyway.
const CLOSED_CHECK: [MacroColumn; 6] = [
    MacroColumn::Cpi,
    MacroColumn::InterestRate,
    MacroColumn::Sp500,
    MacroColumn::Dxy,
    MacroColumn::Vix,
    MacroColumn::Treasury10y,
];

pub fn default_history_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2018, 2, 1).unwrap_or(NaiveDate::MIN)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Merges sparse per-column observations into one row per calendar day.
///
/// Days between the first and last observation are filled in; a day is
/// flagged `market_closed` when none of the `checked` columns had an
/// observation before forward filling.
pub fn merge_daily(
    observations: &BTreeMap<MacroColumn, BTreeMap<NaiveDate, f64>>,
    checked: &BTreeSet<MacroColumn>,
) -> Vec<MacroIndicatorRow> {
    let first = observations.values().filter_map(|s| s.keys().next()).min();
    let last = observations.values().filter_map(|s| s.keys().next_back()).max();
    let (Some(first), Some(last)) = (first.copied(), last.copied()) else {
        return Vec::new();
    };

    let mut carried: BTreeMap<MacroColumn, f64> = BTreeMap::new();
    let mut rows = Vec::new();
    for date in first.iter_days().take_while(|d| *d <= last) {
        let mut row = MacroIndicatorRow::empty(date);
        let mut any_checked = false;
        for (column, series) in observations {
            if let Some(value) = series.get(&date) {
                carried.insert(*column, *value);
                if checked.contains(column) {
                    any_checked = true;
                }
            }
        }
        for (column, value) in &carried {
            row.set(*column, Some(round2(*value)));
        }
        row.market_closed = !any_checked;
        rows.push(row);
    }
    rows
}

pub struct MacroCollector {
    warehouse: SharedWarehouse,
    fred: Arc<dyn MacroSeriesSource>,
    market: Arc<dyn DailyBarSource>,
    /// Column name -> FRED series id.
    series: BTreeMap<String, String>,
    start: NaiveDate,
    policy: BackoffPolicy,
}

impl MacroCollector {
    pub fn new(
        warehouse: SharedWarehouse,
        fred: Arc<dyn MacroSeriesSource>,
        market: Arc<dyn DailyBarSource>,
        series: BTreeMap<String, String>,
    ) -> Self {
        Self {
            warehouse,
            fred,
            market,
            series,
            start: default_history_start(),
            policy: BackoffPolicy::yahoo(),
        }
    }

    pub fn with_start(mut self, start: NaiveDate) -> Self {
        self.start = start;
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl FetchAdapter for MacroCollector {
    fn name(&self) -> &'static str {
        "macro_data"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError> {
        let mut report = FetchReport::default();
        let mut observations: BTreeMap<MacroColumn, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
        let mut checked = BTreeSet::new();

        for (name, series_id) in &self.series {
            let Some(column) = MacroColumn::from_name(name) else {
                report.record_error(name, "unknown macro column");
                continue;
            };
            if CLOSED_CHECK.contains(&column) {
                checked.insert(column);
            }
            let label = format!("fred {}", series_id);
            match retry_with_backoff(&label, &self.policy, || {
                self.fred.observations(series_id, self.start)
            })
            .await
            {
                Ok(points) => {
                    info!("{}: {} observations", series_id, points.len());
                    observations.entry(column).or_default().extend(points);
                }
                Err(e) => report.record_error(series_id, e),
            }
        }

        for (ticker, column) in MARKET_SERIES {
            checked.insert(column);
            let label = format!("yahoo {}", ticker);
            match retry_with_backoff(&label, &self.policy, || {
                self.market.daily_history(ticker, "10y")
            })
            .await
            {
                Ok(bars) => {
                    let series = observations.entry(column).or_default();
                    for bar in bars {
                        let date = bar.timestamp.date_naive();
                        if date >= self.start && bar.close.is_finite() {
                            series.insert(date, bar.close);
                        }
                    }
                }
                Err(e) => report.record_error(ticker, e),
            }
        }

        let rows = merge_daily(&observations, &checked);
        if rows.is_empty() {
            info!("No macro observations available");
            return Ok(report);
        }
        let inserted = self.warehouse.insert_macro_rows(&rows).await?;
        info!(
            "Macro fetch complete: {} days covered, {} new rows (run date {})",
            rows.len(),
            inserted,
            ctx.run_date
        );
        report.records_written = inserted;
        Ok(report)
    }
}

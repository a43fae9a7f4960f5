use crate::collectors::{keep_valid_bars, FetchAdapter, FetchReport};
use crate::database::models::AssetClass;
use crate::database::warehouse::SharedWarehouse;
use crate::error::NodeError;
use crate::indicators::{annotate, IndicatorSet};
use crate::processor::calendar::is_us_trading_day;
use crate::processor::job::RunContext;
use crate::sources::yahoo::yahoo_symbol;
use crate::sources::{retry_with_backoff, BackoffPolicy, DailyBarSource, Pacer};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument};

pub const HISTORY_RANGE: &str = "5y";

/// Daily bars for equities or commodities from the chart API.
pub struct YahooPriceCollector {
    node: &'static str,
    asset_class: AssetClass,
    warehouse: SharedWarehouse,
    source: Arc<dyn DailyBarSource>,
    symbols: Vec<String>,
    /// Static sector metadata applied to the asset dimension.
    sectors: BTreeMap<String, String>,
    policy: BackoffPolicy,
    pacer: Pacer,
}

impl YahooPriceCollector {
    pub fn equities(
        warehouse: SharedWarehouse,
        source: Arc<dyn DailyBarSource>,
        symbols: Vec<String>,
        pacer: Pacer,
    ) -> Self {
        Self {
            node: "stock_data",
            asset_class: AssetClass::Equity,
            warehouse,
            source,
            symbols,
            sectors: BTreeMap::new(),
            policy: BackoffPolicy::yahoo(),
            pacer,
        }
    }

    pub fn commodities(
        warehouse: SharedWarehouse,
        source: Arc<dyn DailyBarSource>,
        symbols: Vec<String>,
        pacer: Pacer,
    ) -> Self {
        Self {
            node: "commodity_data",
            asset_class: AssetClass::Commodity,
            warehouse,
            source,
            symbols,
            sectors: BTreeMap::new(),
            policy: BackoffPolicy::yahoo(),
            pacer,
        }
    }

    pub fn with_sectors(mut self, sectors: BTreeMap<String, String>) -> Self {
        self.sectors = sectors;
        self
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn request_symbol(&self, symbol: &str) -> String {
        match self.asset_class {
            AssetClass::Equity => yahoo_symbol(symbol),
            _ => symbol.to_string(),
        }
    }
}

#[async_trait]
impl FetchAdapter for YahooPriceCollector {
    fn name(&self) -> &'static str {
        self.node
    }

    #[instrument(skip(self, ctx), fields(node = self.node, run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError> {
        let mut report = FetchReport::default();
        if !is_us_trading_day(ctx.run_date) {
            info!("{} is not a trading day, markets closed", ctx.run_date);
            return Ok(report);
        }
        if self.symbols.is_empty() {
            info!("No {} symbols configured", self.asset_class);
            return Ok(report);
        }

        for symbol in &self.symbols {
            if ctx.is_shutting_down() {
                report.record_error(symbol, "shutdown requested before fetch");
                continue;
            }
            self.pacer.wait().await;

            let request_symbol = self.request_symbol(symbol);
            let label = format!("yahoo {}", request_symbol);
            let mut bars = match retry_with_backoff(&label, &self.policy, || {
                self.source.daily_history(&request_symbol, HISTORY_RANGE)
            })
            .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    report.record_error(symbol, e);
                    continue;
                }
            };

            bars.sort_by_key(|b| b.timestamp);
            let mut bars = keep_valid_bars(symbol, bars, &mut report);
            annotate(&mut bars, &IndicatorSet::traditional());

            let asset = self
                .warehouse
                .get_or_create_asset(symbol, self.asset_class, symbol)
                .await?;
            if let Some(sector) = self.sectors.get(symbol) {
                if asset.sector.as_deref() != Some(sector.as_str()) {
                    self.warehouse.set_asset_sector(symbol, sector).await?;
                }
            }
            let inserted = self.warehouse.insert_prices(asset.asset_id, &bars).await?;
            info!("{}: inserted {} rows", symbol, inserted);
            report.records_written += inserted;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryWarehouse;
    use crate::database::models::PricePoint;
    use crate::database::warehouse::Warehouse;
    use crate::test_support::{daily_bars, run_ctx, run_ctx_on, FixedBars};
    use chrono::NaiveDate;

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 2).unwrap()
    }

    #[tokio::test]
    async fn requests_dash_symbols_but_stores_original() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = Arc::new(FixedBars::default().with("BRK-B", daily_bars(start(), 250, 300.0)));
        let adapter = YahooPriceCollector::equities(
            warehouse.clone(),
            source.clone(),
            vec!["BRK.B".to_string()],
            Pacer::disabled("test"),
        )
        .with_policy(BackoffPolicy::no_retry());

        let report = adapter.run(&run_ctx()).await.unwrap();
        assert_eq!(report.records_written, 250);
        assert!(report.errors.is_empty());
        assert_eq!(source.requested(), vec!["BRK-B".to_string()]);

        let assets = warehouse.list_assets(Some(AssetClass::Equity)).await.unwrap();
        assert_eq!(assets[0].symbol, "BRK.B");
        let latest = warehouse.recent_prices(assets[0].asset_id, 1).await.unwrap();
        assert!(latest[0].dynamic_metadata["sma_200"].is_number());
    }

    #[tokio::test]
    async fn short_history_has_no_indicators() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = Arc::new(FixedBars::default().with("GC=F", daily_bars(start(), 30, 1900.0)));
        let adapter = YahooPriceCollector::commodities(
            warehouse.clone(),
            source,
            vec!["GC=F".to_string(), "SI=F".to_string()],
            Pacer::disabled("test"),
        )
        .with_policy(BackoffPolicy::no_retry());

        let report = adapter.run(&run_ctx()).await.unwrap();
        assert_eq!(report.records_written, 30);
        assert_eq!(report.errors.len(), 1);

        let assets = warehouse.list_assets(Some(AssetClass::Commodity)).await.unwrap();
        let latest = warehouse.recent_prices(assets[0].asset_id, 1).await.unwrap();
        assert!(latest[0].dynamic_metadata.get("sma_50").is_none());
    }

    #[tokio::test]
    async fn rejected_bars_do_not_count_toward_history() {
        let mut bars = daily_bars(start(), 200, 150.0);
        // low above close
        bars[100] = PricePoint::daily(bars[100].timestamp, 150.0, 400.0, 300.0, 250.0, 10.0);
        let warehouse = Arc::new(MemoryWarehouse::new());
        let adapter = YahooPriceCollector::equities(
            warehouse.clone(),
            Arc::new(FixedBars::default().with("MSFT", bars)),
            vec!["MSFT".to_string()],
            Pacer::disabled("test"),
        )
        .with_policy(BackoffPolicy::no_retry());

        let report = adapter.run(&run_ctx()).await.unwrap();
        assert_eq!(report.records_written, 199);
        assert_eq!(report.errors.len(), 1);

        let assets = warehouse.list_assets(Some(AssetClass::Equity)).await.unwrap();
        let latest = warehouse.recent_prices(assets[0].asset_id, 1).await.unwrap();
        assert!(latest[0].dynamic_metadata.get("sma_200").is_none());
    }

    #[tokio::test]
    async fn configured_sectors_reach_the_asset_dimension() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = Arc::new(
            FixedBars::default()
                .with("AAPL", daily_bars(start(), 10, 150.0))
                .with("XOM", daily_bars(start(), 10, 110.0)),
        );
        let adapter = YahooPriceCollector::equities(
            warehouse.clone(),
            source,
            vec!["AAPL".to_string(), "XOM".to_string()],
            Pacer::disabled("test"),
        )
        .with_sectors(BTreeMap::from([("AAPL".to_string(), "Information Technology".to_string())]))
        .with_policy(BackoffPolicy::no_retry());

        adapter.run(&run_ctx()).await.unwrap();
        let assets = warehouse.list_assets(Some(AssetClass::Equity)).await.unwrap();
        assert_eq!(assets[0].symbol, "AAPL");
        assert_eq!(assets[0].sector.as_deref(), Some("Information Technology"));
        assert_eq!(assets[1].sector, None);
    }

    #[tokio::test]
    async fn weekends_are_skipped_without_calls() {
        let source = Arc::new(FixedBars::default().with("AAPL", daily_bars(start(), 10, 150.0)));
        let adapter = YahooPriceCollector::equities(
            Arc::new(MemoryWarehouse::new()),
            source.clone(),
            vec!["AAPL".to_string()],
            Pacer::disabled("test"),
        );
        let saturday = NaiveDate::from_ymd_opt(2024, 5, 4).unwrap();
        let report = adapter.run(&run_ctx_on(saturday)).await.unwrap();
        assert_eq!(report, FetchReport::default());
        assert!(source.requested().is_empty());
    }
}

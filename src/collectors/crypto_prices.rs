use crate::collectors::{keep_valid_bars, FetchAdapter, FetchReport};
use crate::config::CryptoAssetConfig;
use crate::database::models::AssetClass;
use crate::database::warehouse::SharedWarehouse;
use crate::error::NodeError;
use crate::indicators::{annotate, attach_market_cap, IndicatorSet};
use crate::processor::job::RunContext;
use crate::sources::{retry_with_backoff, BackoffPolicy, CryptoPriceSource, MarketCapSource, Pacer};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Daily candles requested per pair; enough for the 200-day average.
pub const KLINE_LIMIT: usize = 200;

pub struct CryptoPriceCollector {
    warehouse: SharedWarehouse,
    prices: Arc<dyn CryptoPriceSource>,
    market_caps: Arc<dyn MarketCapSource>,
    assets: Vec<CryptoAssetConfig>,
    cap_policy: BackoffPolicy,
    price_policy: BackoffPolicy,
    pacer: Pacer,
}

impl CryptoPriceCollector {
    pub fn new(
        warehouse: SharedWarehouse,
        prices: Arc<dyn CryptoPriceSource>,
        market_caps: Arc<dyn MarketCapSource>,
        assets: Vec<CryptoAssetConfig>,
        pacer: Pacer,
    ) -> Self {
        Self {
            warehouse,
            prices,
            market_caps,
            assets,
            cap_policy: BackoffPolicy::coingecko(),
            price_policy: BackoffPolicy::default_http(),
            pacer,
        }
    }

    pub fn with_policies(mut self, cap_policy: BackoffPolicy, price_policy: BackoffPolicy) -> Self {
        self.cap_policy = cap_policy;
        self.price_policy = price_policy;
        self
    }

    async fn market_cap(&self, asset: &CryptoAssetConfig) -> Option<f64> {
        let coin_id = asset.coingecko_id.as_deref()?;
        let label = format!("coingecko {}", coin_id);
        match retry_with_backoff(&label, &self.cap_policy, || {
            self.market_caps.market_cap_usd(coin_id)
        })
        .await
        {
            Ok(cap) => cap,
            Err(e) => {
                warn!("Market cap unavailable for {}: {}", asset.symbol, e);
                None
            }
        }
    }
}

#[async_trait]
impl FetchAdapter for CryptoPriceCollector {
    fn name(&self) -> &'static str {
        "binance_data"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError> {
        let mut report = FetchReport::default();
        if self.assets.is_empty() {
            info!("No crypto assets configured, nothing to fetch");
            return Ok(report);
        }

        for asset in &self.assets {
            if ctx.is_shutting_down() {
                report.record_error(&asset.symbol, "shutdown requested before fetch");
                continue;
            }
            self.pacer.wait().await;

            let market_cap = self.market_cap(asset).await;
            let label = format!("binance {}", asset.pair);
            let bars = match retry_with_backoff(&label, &self.price_policy, || {
                self.prices.daily_klines(&asset.pair, KLINE_LIMIT)
            })
            .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    report.record_error(&asset.symbol, e);
                    continue;
                }
            };

            let mut bars = bars;
            bars.sort_by_key(|b| b.timestamp);
            let mut bars = keep_valid_bars(&asset.symbol, bars, &mut report);
            annotate(&mut bars, &IndicatorSet::crypto());
            attach_market_cap(&mut bars, market_cap);

            let name = asset.name.as_deref().unwrap_or(&asset.symbol);
            let stored = self
                .warehouse
                .get_or_create_asset(&asset.symbol, AssetClass::Crypto, name)
                .await?;
            let inserted = self.warehouse.insert_prices(stored.asset_id, &bars).await?;
            info!(
                "{}: {} bars fetched, {} new rows",
                asset.symbol,
                bars.len(),
                inserted
            );
            report.records_written += inserted;
        }

        Ok(report)
    }
}

use crate::collectors::crypto_news::CRYPTO_TAG;
use crate::database::models::{Asset, AssetAnalysis, AssetClass, NewsArticle, PricePoint};
use crate::database::warehouse::SharedWarehouse;
use crate::enrichment::decoder::decode_verdict;
use crate::enrichment::{ask_structured, EnrichmentStage, StageReport};
use crate::error::NodeError;
use crate::processor::calendar::is_us_trading_day;
use crate::processor::job::RunContext;
use crate::sources::llm::PacedModel;
use crate::sources::{LanguageModel, Pacer};
use crate::utils::utils::truncate_string;
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const PRICE_ROWS: usize = 200;
pub const NEWS_ROWS: usize = 5;

/// Per-asset technical verdicts. A full pass is slow by construction (one
/// model call per pacing interval), so it can be interrupted between assets
/// and resumed later: assets analysed today are skipped.
pub struct AssetAnalysisStage {
    warehouse: SharedWarehouse,
    llm: PacedModel,
    model: String,
}

impl AssetAnalysisStage {
    pub fn new(
        warehouse: SharedWarehouse,
        llm: Arc<dyn LanguageModel>,
        model: &str,
        pacer: Pacer,
    ) -> Self {
        Self {
            warehouse,
            llm: PacedModel::new(llm, pacer),
            model: model.to_string(),
        }
    }

    async fn recent_news(&self, asset: &Asset) -> Result<Vec<NewsArticle>, NodeError> {
        let tag = match asset.asset_class {
            AssetClass::Crypto => CRYPTO_TAG,
            _ => asset.symbol.as_str(),
        };
        Ok(self.warehouse.recent_articles_for_tag(tag, NEWS_ROWS).await?)
    }
}

fn price_table(bars: &[PricePoint]) -> String {
    let mut table = String::from("date        open        high        low         close       volume          indicators\n");
    for bar in bars {
        let _ = writeln!(
            table,
            "{}  {:<10.4}  {:<10.4}  {:<10.4}  {:<10.4}  {:<14.0}  {}",
            bar.timestamp.date_naive(),
            bar.open,
            bar.high,
            bar.low,
            bar.close,
            bar.volume,
            bar.dynamic_metadata
        );
    }
    table
}

fn analysis_prompt(
    asset: &Asset,
    macro_context: &str,
    bars: &[PricePoint],
    news: &[NewsArticle],
) -> String {
    let headlines = if news.is_empty() {
        "No recent news available".to_string()
    } else {
        news.iter()
            .map(|a| format!("- {} ({})", a.title, a.date()))
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are a Senior Financial Analyst. Analyze {symbol} ({class}) and provide a structured assessment.

MACRO CONTEXT:
{macro_context}

PRICE DATA (last {rows} days):
{prices}
RECENT NEWS:
{headlines}

Respond with ONLY valid JSON in this shape:
{{
  \"trend_signal\": \"Bullish\" | \"Bearish\" | \"Neutral\",
  \"key_levels\": {{\"support\": [price1, price2], \"resistance\": [price1, price2]}},
  \"summary_text\": \"2-3 sentence executive summary with price targets and catalysts\"
}}

Rules:
- trend_signal must be exactly one of: Bullish, Bearish, Neutral
- support and resistance hold 2 realistic price levels based on recent data",
        symbol = asset.symbol,
        class = asset.asset_class,
        macro_context = macro_context,
        rows = bars.len(),
        prices = price_table(bars),
        headlines = headlines
    )
}

#[async_trait]
impl EnrichmentStage for AssetAnalysisStage {
    fn name(&self) -> &'static str {
        "asset_analysis"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<StageReport, NodeError> {
        let date = ctx.run_date;
        let macro_summary = self.warehouse.latest_macro_summary().await?.ok_or_else(|| {
            error!("No macro summary found - run macro_summary first");
            NodeError::PreconditionMissing("no macro summary available".to_string())
        })?;

        let assets = if is_us_trading_day(date) {
            info!("Trading day detected - analyzing all assets");
            self.warehouse.list_assets(None).await?
        } else {
            info!("Markets closed on {} - analyzing CRYPTO only", date);
            self.warehouse.list_assets(Some(AssetClass::Crypto)).await?
        };
        let total = assets.len();
        info!("Found {} assets to analyze", total);

        let mut report = StageReport::default();
        let mut failed_symbols = Vec::new();
        for (i, asset) in assets.iter().enumerate() {
            if ctx.is_shutting_down() {
                warn!("Shutdown requested - stopping after {} of {} assets", i, total);
                report.note = Some(format!("interrupted after {} of {} assets", i, total));
                break;
            }
            report.processed += 1;
            info!("[{}/{}] Analyzing {} ({})", i + 1, total, asset.symbol, asset.asset_class);

            if self.warehouse.analysis_exists(asset.asset_id, date).await? {
                info!("{}: analysis already exists for {}, skipping", asset.symbol, date);
                report.succeeded += 1;
                continue;
            }

            let bars = self.warehouse.recent_prices(asset.asset_id, PRICE_ROWS).await?;
            if bars.is_empty() {
                warn!("{}: no price data found, skipping", asset.symbol);
                report.failed += 1;
                failed_symbols.push(asset.symbol.clone());
                continue;
            }
            let news = self.recent_news(asset).await?;

            let prompt = analysis_prompt(asset, &macro_summary.summary_text, &bars, &news);
            let verdict = match ask_structured(&self.llm, &self.model, &prompt, &asset.symbol, decode_verdict).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!("{}: failed after retry: {}", asset.symbol, e);
                    report.failed += 1;
                    failed_symbols.push(asset.symbol.clone());
                    continue;
                }
            };

            info!(
                "{}: {} - {}",
                asset.symbol,
                verdict.trend_signal.as_str(),
                truncate_string(&verdict.summary_text, 50)
            );
            self.warehouse
                .upsert_analysis(&AssetAnalysis {
                    asset_id: asset.asset_id,
                    date,
                    model_name: self.model.clone(),
                    trend_signal: verdict.trend_signal,
                    key_levels: verdict.key_levels,
                    summary_text: verdict.summary_text,
                })
                .await?;
            report.succeeded += 1;
        }

        info!("Asset analysis complete: {}/{} succeeded", report.succeeded, total);
        if !failed_symbols.is_empty() {
            warn!("Failed: {}", failed_symbols.join(", "));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryWarehouse;
    use crate::database::models::{MacroSummary, TrendSignal};
    use crate::database::warehouse::Warehouse;
    use crate::test_support::{daily_bars, run_ctx, run_ctx_on, trading_day, ScriptedLlm};
    use chrono::{Duration, NaiveDate};
    use tokio::sync::watch;

    const VERDICT: &str = r#"{"trend_signal":"Bullish","key_levels":{"support":[101,99],"resistance":[120,125]},"summary_text":"Uptrend intact above the 50-day average."}"#;

    async fn seeded(with_macro: bool) -> Arc<MemoryWarehouse> {
        let warehouse = Arc::new(MemoryWarehouse::new());
        for (symbol, class) in [
            ("AAPL", AssetClass::Equity),
            ("BTC", AssetClass::Crypto),
            ("GC=F", AssetClass::Commodity),
        ] {
            let asset = warehouse.get_or_create_asset(symbol, class, symbol).await.unwrap();
            let bars = daily_bars(trading_day() - Duration::days(30), 30, 100.0);
            warehouse.insert_prices(asset.asset_id, &bars).await.unwrap();
        }
        if with_macro {
            warehouse
                .insert_macro_summary(&MacroSummary {
                    date: trading_day(),
                    period_start: trading_day() - Duration::days(365),
                    period_end: trading_day(),
                    model_name: "gemma".to_string(),
                    summary_text: "Risk-on, easing inflation.".to_string(),
                    summary_short: "Risk-on.".to_string(),
                })
                .await
                .unwrap();
        }
        warehouse
    }

    fn stage(warehouse: Arc<MemoryWarehouse>, llm: Arc<ScriptedLlm>) -> AssetAnalysisStage {
        AssetAnalysisStage::new(warehouse, llm, "gemma", Pacer::disabled("test"))
    }

    #[tokio::test]
    async fn second_run_makes_no_external_calls() {
        let warehouse = seeded(true).await;
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(VERDICT.to_string())));
        let analysis = stage(warehouse.clone(), llm.clone());

        let report = analysis.run(&run_ctx()).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(llm.calls(), 3);
        let stored = warehouse.analysis_for(1, trading_day()).unwrap();
        assert_eq!(stored.trend_signal, TrendSignal::Bullish);
        assert_eq!(stored.key_levels.resistance, vec![120.0, 125.0]);

        let again = analysis.run(&run_ctx()).await.unwrap();
        assert_eq!(again.succeeded, 3);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn invalid_verdict_is_retried_once_per_asset() {
        let warehouse = seeded(true).await;
        let lower = VERDICT.replace("Bullish", "bullish");
        let llm = Arc::new(ScriptedLlm::responder(move |_, prompt| {
            if prompt.contains("Analyze AAPL") {
                Ok(lower.clone())
            } else {
                Ok(VERDICT.to_string())
            }
        }));
        let report = stage(warehouse.clone(), llm.clone()).run(&run_ctx()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(llm.calls(), 4);
    }

    #[tokio::test]
    async fn requires_a_macro_summary() {
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(VERDICT.to_string())));
        let err = stage(seeded(false).await, llm.clone()).run(&run_ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "precondition_missing");
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn weekends_only_cover_crypto() {
        let sunday = NaiveDate::from_ymd_opt(2024, 5, 5).unwrap();
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(VERDICT.to_string())));
        let report = stage(seeded(true).await, llm.clone()).run(&run_ctx_on(sunday)).await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(llm.prompts()[0].1.contains("Analyze BTC (CRYPTO)"));
    }

    #[tokio::test]
    async fn stops_between_assets_on_shutdown() {
        let warehouse = seeded(true).await;
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(VERDICT.to_string())));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let ctx = RunContext::new("test", trading_day(), rx);
        let report = stage(warehouse, llm.clone()).run(&ctx).await.unwrap();
        assert_eq!(report.processed, 0);
        assert!(report.note.unwrap().starts_with("interrupted"));
        assert_eq!(llm.calls(), 0);
    }
}

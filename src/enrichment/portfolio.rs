use crate::collectors::crypto_news::CRYPTO_TAG;
use crate::database::models::{
    Asset, AssetClass, NewsArticle, PortfolioRecommendation, RiskProfile, SentimentPoint,
    TrendSignal,
};
use crate::database::warehouse::SharedWarehouse;
use crate::enrichment::decoder::decode_portfolio;
use crate::enrichment::{ask_structured, EnrichmentStage, StageReport};
use crate::error::NodeError;
use crate::indicators::stats::{self, CorrelationPair};
use crate::processor::job::RunContext;
use crate::sources::llm::PacedModel;
use crate::sources::{LanguageModel, Pacer};
use crate::utils::utils::approx_token_count;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

pub const NEWS_SAMPLE_LIMIT: usize = 50;
pub const NEWS_WINDOW_DAYS: i64 = 7;
pub const SENTIMENT_POINTS: usize = 7;
pub const CORRELATION_PAIRS: usize = 20;
/// 90 daily returns need 91 closes.
const PRICE_LOOKBACK: usize = 91;

/// Everything the model sees about one analysed asset.
#[derive(Debug, Clone)]
pub struct AssetSnapshot {
    pub symbol: String,
    pub asset_class: AssetClass,
    pub sector: String,
    pub trend: TrendSignal,
    pub analysis: String,
    pub analysis_date: NaiveDate,
    pub price: Option<f64>,
    pub change_7d: Option<f64>,
    pub change_30d: Option<f64>,
    pub volatility_30d: Option<f64>,
    pub volume_ratio: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SectorCounts {
    pub assets: usize,
    pub bullish: usize,
    pub bearish: usize,
    pub neutral: usize,
}

/// Inputs shared by the prompts of every risk profile.
#[derive(Debug, Clone)]
pub struct PortfolioContext {
    pub macro_summary: String,
    pub assets: Vec<AssetSnapshot>,
    pub sectors: BTreeMap<String, SectorCounts>,
    pub correlations: Vec<CorrelationPair>,
    pub news: Vec<NewsArticle>,
    pub sentiment: Vec<SentimentPoint>,
}

impl PortfolioContext {
    pub fn technicals_count(&self) -> usize {
        self.assets.iter().filter(|a| a.volatility_30d.is_some()).count()
    }
}

pub fn sector_counts(assets: &[AssetSnapshot]) -> BTreeMap<String, SectorCounts> {
    let mut sectors: BTreeMap<String, SectorCounts> = BTreeMap::new();
    for asset in assets {
        let entry = sectors.entry(asset.sector.clone()).or_default();
        entry.assets += 1;
        match asset.trend {
            TrendSignal::Bullish => entry.bullish += 1,
            TrendSignal::Bearish => entry.bearish += 1,
            TrendSignal::Neutral => entry.neutral += 1,
        }
    }
    sectors
}

/// Interleaves articles by asset class so no class crowds out the others.
pub fn balanced_news(
    articles: Vec<NewsArticle>,
    class_of_symbol: &HashMap<String, AssetClass>,
    limit: usize,
) -> Vec<NewsArticle> {
    let mut buckets: BTreeMap<AssetClass, VecDeque<NewsArticle>> = BTreeMap::new();
    for article in articles {
        let class = if article.related_tickers.iter().any(|t| t == CRYPTO_TAG) {
            AssetClass::Crypto
        } else {
            article
                .related_tickers
                .iter()
                .find_map(|t| class_of_symbol.get(t).copied())
                .unwrap_or(AssetClass::Equity)
        };
        buckets.entry(class).or_default().push_back(article);
    }

    let mut sample = Vec::with_capacity(limit);
    while sample.len() < limit {
        let mut took_any = false;
        for bucket in buckets.values_mut() {
            if sample.len() >= limit {
                break;
            }
            if let Some(article) = bucket.pop_front() {
                sample.push(article);
                took_any = true;
            }
        }
        if !took_any {
            break;
        }
    }
    sample
}

fn percent(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}%", v))
}

pub fn portfolio_prompt(context: &PortfolioContext, profile: RiskProfile) -> String {
    let mut prompt = format!(
        "You are a professional portfolio manager. Generate a comprehensive portfolio \
recommendation for a **{}** risk profile.\n\n**Macroeconomic Summary:**\n{}\n\n**Sector Overview:**\n",
        profile, context.macro_summary
    );
    for (sector, counts) in &context.sectors {
        let _ = writeln!(
            prompt,
            "- {}: {} assets ({} bullish, {} bearish, {} neutral)",
            sector, counts.assets, counts.bullish, counts.bearish, counts.neutral
        );
    }

    prompt.push_str("\n**Detailed Asset Analyses:**\n\n");
    for asset in &context.assets {
        let _ = write!(
            prompt,
            "**{}** ({}):\n- Trend: {}\n- Analysis: {}\n- Price: {}, 7d: {}, 30d: {}\n",
            asset.symbol,
            asset.asset_class,
            asset.trend.as_str(),
            asset.analysis,
            asset.price.map_or_else(|| "n/a".to_string(), |p| format!("${:.2}", p)),
            percent(asset.change_7d),
            percent(asset.change_30d),
        );
        if let Some(vol) = asset.volatility_30d {
            let _ = writeln!(
                prompt,
                "- Volatility (30d): {:.2}%, Volume: {:.2}x avg",
                vol,
                asset.volume_ratio.unwrap_or(0.0)
            );
        }
        prompt.push('\n');
    }

    let _ = writeln!(prompt, "**Asset Correlations (top {} pairs):**", context.correlations.len());
    for pair in &context.correlations {
        let _ = writeln!(prompt, "- {}-{}: {:.2}", pair.first, pair.second, pair.correlation);
    }

    let _ = write!(
        prompt,
        "\n**Recent News (last {} days - {} articles):**\n\n",
        NEWS_WINDOW_DAYS,
        context.news.len()
    );
    for article in &context.news {
        let _ = write!(
            prompt,
            "- **{}**\n  {}\n\n",
            article.title,
            article.summary.as_deref().unwrap_or("")
        );
    }

    prompt.push_str("**Crypto Market Psychology (Fear & Greed Index):**\n");
    if context.sentiment.is_empty() {
        prompt.push_str("- No FGI data available\n");
    }
    for point in &context.sentiment {
        let _ = writeln!(prompt, "- {}: {} ({})", point.date, point.value, point.classification);
    }

    prompt.push_str("\n**Instructions:**\n\
1. Recommend allocation percentages across stocks, crypto and commodities (they must sum to exactly 100)\n\
2. Select 10-15 top picks with specific weights\n\
3. For each pick give symbol, name, weight (%), rationale, sector, correlation notes \
(avoid pairs above 0.8), price momentum, volatility and volume status\n\
4. Calculate sector exposure percentages\n\
5. Provide a diversification score (0-10)\n\
6. Explain the correlation analysis and risk management\n\
7. List 5-7 key risks\n\
8. Recommend a rebalance frequency\n\n\
**Risk Profile Guidelines:**\n");
    for p in RiskProfile::ALL {
        let g = p.guidance();
        let _ = writeln!(
            prompt,
            "- {}: {}% stocks, {}% commodities, {}% crypto",
            p, g.stocks, g.commodities, g.crypto
        );
    }

    prompt.push_str(
        r#"
Return ONLY valid JSON in this exact format:
{
    "allocation": {"stocks": 70, "crypto": 10, "commodities": 20},
    "top_picks": [
        {"symbol": "AAPL", "name": "Apple Inc.", "weight": 10, "rationale": "...",
         "sector": "Technology", "correlation_notes": "...", "price_momentum": "Strong Bullish",
         "volatility": "Low (0.8%)", "volume_status": "Normal"}
    ],
    "sector_exposure": {"Technology": 30, "Healthcare": 20},
    "diversification_score": 8.5,
    "correlation_analysis": "...",
    "overall_rationale": "...",
    "news_impact": "...",
    "risks": ["risk 1", "risk 2"],
    "rebalance_frequency": "Quarterly"
}
"#,
    );
    prompt
}

/// Weekly allocation advice for every risk profile.
pub struct PortfolioStage {
    warehouse: SharedWarehouse,
    llm: PacedModel,
    model: String,
}

impl PortfolioStage {
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

    async fn snapshot(
        &self,
        asset: &Asset,
        analysis_date: NaiveDate,
        trend: TrendSignal,
        text: String,
    ) -> Result<(AssetSnapshot, Vec<f64>), NodeError> {
        let bars = self.warehouse.recent_prices(asset.asset_id, PRICE_LOOKBACK).await?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let volumes: Vec<f64> = bars.iter().map(|b| b.volume).collect();
        let snapshot = AssetSnapshot {
            symbol: asset.symbol.clone(),
            asset_class: asset.asset_class,
            sector: asset
                .sector
                .clone()
                .unwrap_or_else(|| asset.asset_class.to_string()),
            trend,
            analysis: text,
            analysis_date,
            price: closes.last().copied(),
            change_7d: stats::change_over(&closes, 7),
            change_30d: stats::change_over(&closes, 30),
            volatility_30d: stats::volatility(&closes, 30),
            volume_ratio: stats::volume_ratio(&volumes, 30),
        };
        Ok((snapshot, stats::daily_returns(&closes)))
    }

    /// Collects the shared prompt context. Fails when no macro summary exists.
    pub async fn build_context(&self, run_date: NaiveDate) -> Result<PortfolioContext, NodeError> {
        let macro_summary = self.warehouse.latest_macro_summary().await?.ok_or_else(|| {
            error!("No macro summary found - weekly recommendation needs the daily pipeline output");
            NodeError::PreconditionMissing("no macro summary available".to_string())
        })?;

        let assets: HashMap<i32, Asset> = self
            .warehouse
            .list_assets(None)
            .await?
            .into_iter()
            .map(|a| (a.asset_id, a))
            .collect();
        let class_of_symbol: HashMap<String, AssetClass> = assets
            .values()
            .map(|a| (a.symbol.clone(), a.asset_class))
            .collect();

        let mut snapshots = Vec::new();
        let mut returns = BTreeMap::new();
        for analysis in self.warehouse.latest_analyses().await? {
            let Some(asset) = assets.get(&analysis.asset_id) else {
                warn!("Analysis for unknown asset {} ignored", analysis.asset_id);
                continue;
            };
            let (snapshot, asset_returns) = self
                .snapshot(asset, analysis.date, analysis.trend_signal, analysis.summary_text)
                .await?;
            returns.insert(snapshot.symbol.clone(), asset_returns);
            snapshots.push(snapshot);
        }
        snapshots.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        let newest = snapshots.iter().map(|s| s.analysis_date).max();
        match newest {
            Some(date) if date < run_date => warn!(
                "Newest asset analysis is from {} - recommendations will use stale analyses",
                date
            ),
            None => warn!("No asset analyses available"),
            _ => {}
        }

        let correlations = tokio::task::spawn_blocking(move || {
            stats::top_correlations(&returns, CORRELATION_PAIRS)
        })
        .await
        .map_err(|e| NodeError::Transient(format!("correlation task failed: {}", e)))?;

        let since = Utc.from_utc_datetime(
            &(run_date - Duration::days(NEWS_WINDOW_DAYS)).and_time(NaiveTime::MIN),
        );
        let news = balanced_news(
            self.warehouse.articles_since(since).await?,
            &class_of_symbol,
            NEWS_SAMPLE_LIMIT,
        );
        let sentiment = self.warehouse.recent_sentiment(SENTIMENT_POINTS).await?;

        Ok(PortfolioContext {
            macro_summary: macro_summary.summary_text,
            sectors: sector_counts(&snapshots),
            assets: snapshots,
            correlations,
            news,
            sentiment,
        })
    }
}

#[async_trait]
impl EnrichmentStage for PortfolioStage {
    fn name(&self) -> &'static str {
        "weekly_portfolio_recommendation"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<StageReport, NodeError> {
        let context = self.build_context(ctx.run_date).await?;
        info!(
            "Fetched {} analysed assets, {} news articles, {} correlation pairs",
            context.assets.len(),
            context.news.len(),
            context.correlations.len()
        );

        let mut report = StageReport::default();
        let mut last_error = None;
        for profile in RiskProfile::ALL {
            if ctx.is_shutting_down() {
                report.note = Some("interrupted by shutdown".to_string());
                break;
            }
            report.processed += 1;
            info!("Generating {} portfolio recommendation...", profile);

            let prompt = portfolio_prompt(&context, profile);
            let token_count = approx_token_count(&prompt);
            info!("  - Prompt size: ~{} tokens", token_count);

            let draft = match ask_structured(
                &self.llm,
                &self.model,
                &prompt,
                profile.as_str(),
                decode_portfolio,
            )
            .await
            {
                Ok(draft) => draft,
                Err(e) => {
                    error!("{} recommendation failed: {}", profile, e);
                    report.failed += 1;
                    last_error = Some(e);
                    continue;
                }
            };

            let metadata: Value = json!({
                "token_count": token_count,
                "data_sources": {
                    "assets_count": context.assets.len(),
                    "news_count": context.news.len(),
                    "correlations_count": context.correlations.len(),
                    "technicals_count": context.technicals_count(),
                }
            });
            self.warehouse
                .upsert_recommendation(&PortfolioRecommendation {
                    date: ctx.run_date,
                    risk_profile: profile,
                    model_name: self.model.clone(),
                    allocation: draft.allocation,
                    top_picks: draft.top_picks,
                    sector_exposure: draft.sector_exposure,
                    diversification_score: draft.diversification_score,
                    correlation_analysis: draft.correlation_analysis,
                    overall_rationale: draft.overall_rationale,
                    news_impact: draft.news_impact,
                    risks: draft.risks,
                    rebalance_frequency: draft.rebalance_frequency,
                    metadata,
                })
                .await?;
            report.succeeded += 1;
            info!("  - [OK] {} recommendation saved", profile);
        }

        match last_error {
            Some(e) if report.succeeded == 0 => Err(e.into()),
            _ => Ok(report),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryWarehouse;
    use crate::database::models::{ArticleDraft, AssetAnalysis, KeyLevels, MacroSummary};
    use crate::database::warehouse::Warehouse;
    use crate::test_support::{daily_bars, run_ctx, trading_day, ScriptedLlm};

    const REPLY: &str = r#"```json
{"allocation":{"stocks":70,"crypto":10,"commodities":20},
 "top_picks":[{"symbol":"AAPL","name":"Apple","weight":40,"rationale":"Quality"},
              {"symbol":"BTC","name":"Bitcoin","weight":10,"rationale":"Momentum","sector":"Crypto"}],
 "sector_exposure":{"Technology":40,"Crypto":10},
 "diversification_score":7,
 "overall_rationale":"Balanced growth.",
 "risks":["Sticky inflation","Regulation"],
 "rebalance_frequency":"Quarterly"}
```"#;

    async fn seeded() -> Arc<MemoryWarehouse> {
        let warehouse = Arc::new(MemoryWarehouse::new());
        for (i, (symbol, class)) in [("AAPL", AssetClass::Equity), ("BTC", AssetClass::Crypto)]
            .into_iter()
            .enumerate()
        {
            let asset = warehouse.get_or_create_asset(symbol, class, symbol).await.unwrap();
            let bars = daily_bars(trading_day() - Duration::days(60), 60, 100.0 + i as f64 * 50.0);
            warehouse.insert_prices(asset.asset_id, &bars).await.unwrap();
            warehouse
                .upsert_analysis(&AssetAnalysis {
                    asset_id: asset.asset_id,
                    date: trading_day(),
                    model_name: "gemma".to_string(),
                    trend_signal: if i == 0 { TrendSignal::Bullish } else { TrendSignal::Neutral },
                    key_levels: KeyLevels::default(),
                    summary_text: format!("{} outlook", symbol),
                })
                .await
                .unwrap();
        }
        warehouse
            .insert_macro_summary(&MacroSummary {
                date: trading_day(),
                period_start: trading_day() - Duration::days(365),
                period_end: trading_day(),
                model_name: "gemma".to_string(),
                summary_text: "Disinflation with resilient growth.".to_string(),
                summary_short: "Goldilocks.".to_string(),
            })
            .await
            .unwrap();
        warehouse
    }

    fn stage(warehouse: Arc<MemoryWarehouse>, llm: Arc<ScriptedLlm>) -> PortfolioStage {
        PortfolioStage::new(warehouse, llm, "flash", Pacer::disabled("test"))
    }

    #[tokio::test]
    async fn one_recommendation_per_profile_with_metadata() {
        let warehouse = seeded().await;
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(REPLY.to_string())));
        let report = stage(warehouse.clone(), llm.clone()).run(&run_ctx()).await.unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(llm.calls(), 3);

        let stored = warehouse
            .recommendation_for(trading_day(), RiskProfile::Moderate)
            .unwrap();
        assert_eq!(stored.allocation.total(), 100.0);
        assert_eq!(stored.top_picks.len(), 2);
        assert_eq!(stored.metadata["data_sources"]["assets_count"], 2);
        assert_eq!(stored.metadata["data_sources"]["technicals_count"], 2);
        assert!(stored.metadata["token_count"].as_u64().unwrap() > 100);

        let prompt = &llm.prompts()[0].1;
        assert!(prompt.contains("**Conservative** risk profile"));
        assert!(prompt.contains("- EQUITY: 1 assets (1 bullish, 0 bearish, 0 neutral)"));
        assert!(prompt.contains("AAPL-BTC"));
    }

    #[tokio::test]
    async fn bad_allocation_is_retried_and_profile_skipped() {
        let warehouse = seeded().await;
        let bad = REPLY.replace("\"commodities\":20", "\"commodities\":25");
        let llm = Arc::new(ScriptedLlm::responder(move |_, prompt| {
            if prompt.contains("**Aggressive**") {
                Ok(bad.clone())
            } else {
                Ok(REPLY.to_string())
            }
        }));
        let report = stage(warehouse.clone(), llm.clone()).run(&run_ctx()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(llm.calls(), 4);
        assert!(warehouse
            .recommendation_for(trading_day(), RiskProfile::Aggressive)
            .is_none());
    }

    #[tokio::test]
    async fn needs_a_macro_summary() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(REPLY.to_string())));
        let err = stage(warehouse, llm.clone()).run(&run_ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "precondition_missing");
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn news_sample_alternates_asset_classes() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let article = |id: i64, tag: &str| NewsArticle {
            article_id: id,
            url: format!("https://n/{}", id),
            source: "Wire".to_string(),
            title: format!("t{}", id),
            summary: None,
            published_at: at,
            related_tickers: vec![tag.to_string()],
        };
        let articles = vec![
            article(1, "AAPL"),
            article(2, "MSFT"),
            article(3, "AAPL"),
            article(4, CRYPTO_TAG),
            article(5, "GC=F"),
        ];
        let classes = HashMap::from([("GC=F".to_string(), AssetClass::Commodity)]);
        let ids: Vec<_> = balanced_news(articles, &classes, 4).iter().map(|a| a.article_id).collect();
        assert_eq!(ids, vec![4, 1, 5, 2]);
    }

    #[test]
    fn sectors_fall_back_to_asset_class() {
        let snapshot = |symbol: &str, trend| AssetSnapshot {
            symbol: symbol.to_string(),
            asset_class: AssetClass::Equity,
            sector: "EQUITY".to_string(),
            trend,
            analysis: String::new(),
            analysis_date: trading_day(),
            price: None,
            change_7d: None,
            change_30d: None,
            volatility_30d: None,
            volume_ratio: None,
        };
        let counts = sector_counts(&[
            snapshot("A", TrendSignal::Bullish),
            snapshot("B", TrendSignal::Bearish),
            snapshot("C", TrendSignal::Bearish),
        ]);
        assert_eq!(
            counts["EQUITY"],
            SectorCounts {
                assets: 3,
                bullish: 1,
                bearish: 2,
                neutral: 0
            }
        );
    }

    #[tokio::test]
    async fn stored_sectors_drive_sector_aggregates() {
        let warehouse = seeded().await;
        warehouse.set_asset_sector("AAPL", "Information Technology").await.unwrap();
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(REPLY.to_string())));
        let context = stage(warehouse, llm).build_context(trading_day()).await.unwrap();

        assert_eq!(context.sectors["Information Technology"].bullish, 1);
        assert!(!context.sectors.contains_key("EQUITY"));
        let aapl = context.assets.iter().find(|a| a.symbol == "AAPL").unwrap();
        assert_eq!(aapl.sector, "Information Technology");
    }

    #[tokio::test]
    async fn news_window_is_seven_days() {
        let warehouse = seeded().await;
        let draft = |n: i64, days_ago: i64| ArticleDraft {
            url: format!("https://n/{}", n),
            source: "Wire".to_string(),
            title: format!("story {}", n),
            summary: None,
            published_at: Utc.from_utc_datetime(
                &(trading_day() - Duration::days(days_ago)).and_time(NaiveTime::MIN),
            ),
            related_tickers: vec!["AAPL".to_string()],
        };
        warehouse.insert_articles(&[draft(1, 2), draft(2, 9)]).await.unwrap();
        let llm = Arc::new(ScriptedLlm::responder(|_, _| Ok(REPLY.to_string())));
        let context = stage(warehouse, llm).build_context(trading_day()).await.unwrap();
        assert_eq!(context.news.len(), 1);
        assert_eq!(context.news[0].title, "story 1");
    }
}

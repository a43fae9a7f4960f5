//! Wires the fetch adapters and enrichment stages into the task graph.

use crate::cache::SharedRunLock;
use crate::collectors::{
    CryptoNewsCollector, CryptoPriceCollector, EquityNewsCollector, FetchAdapter, MacroCollector,
    SentimentCollector, YahooPriceCollector,
};
use crate::config::PipelineConfig;
use crate::database::warehouse::SharedWarehouse;
use crate::enrichment::{
    AssetAnalysisStage, EnrichmentStage, MacroSummaryStage, NewsSummaryStage, PortfolioStage,
    SummaryScope, TopNewsStage,
};
use crate::error::{GraphError, NodeError, SourceError};
use crate::processor::graph::{NodeSpec, QuotaGroup, TaskGraph, TaskGraphBuilder};
use crate::processor::job::{NodeAction, NodeGroup, RunContext};
use crate::sources::binance::BinanceClient;
use crate::sources::coingecko::CoinGeckoClient;
use crate::sources::fear_greed::FearGreedClient;
use crate::sources::fred::FredClient;
use crate::sources::llm::GeminiClient;
use crate::sources::rss::RssClient;
use crate::sources::scrape::HttpScraper;
use crate::sources::yahoo::YahooClient;
use crate::sources::{
    http_client, ArticleScraper, CryptoPriceSource, DailyBarSource, EquityNewsSource, FeedSource,
    LanguageModel, MacroSeriesSource, MarketCapSource, Pacer, SentimentSource,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub const BINANCE_DATA: &str = "binance_data";
pub const MACRO_DATA: &str = "macro_data";
pub const STOCK_DATA: &str = "stock_data";
pub const COMMODITY_DATA: &str = "commodity_data";
pub const FGI_DATA: &str = "fgi_data";
pub const CRYPTO_NEWS: &str = "crypto_news";
pub const STOCK_NEWS: &str = "stock_news";
pub const MACRO_SUMMARY: &str = "macro_summary";
pub const DAILY_NEWS_SUMMARIES: &str = "daily_news_summaries";
pub const TOP_NEWS: &str = "top_news";
pub const ASSET_ANALYSIS: &str = "asset_analysis";
pub const WEEKLY_PORTFOLIO_RECOMMENDATION: &str = "weekly_portfolio_recommendation";

pub const ALL_NODES: [&str; 12] = [
    BINANCE_DATA,
    MACRO_DATA,
    STOCK_DATA,
    COMMODITY_DATA,
    FGI_DATA,
    CRYPTO_NEWS,
    STOCK_NEWS,
    MACRO_SUMMARY,
    DAILY_NEWS_SUMMARIES,
    TOP_NEWS,
    ASSET_ANALYSIS,
    WEEKLY_PORTFOLIO_RECOMMENDATION,
];

const CRYPTO_ASSET_PACING: Duration = Duration::from_secs(6);
const EQUITY_PACING: Duration = Duration::from_secs(2);
const COMMODITY_PACING: Duration = Duration::from_secs(1);
const EQUITY_NEWS_PACING: Duration = Duration::from_millis(500);

/// Runs a fetch adapter as a graph node.
pub struct FetchNode {
    adapter: Arc<dyn FetchAdapter>,
}

impl FetchNode {
    pub fn new(adapter: impl FetchAdapter + 'static) -> Self {
        Self {
            adapter: Arc::new(adapter),
        }
    }
}

#[async_trait]
impl NodeAction for FetchNode {
    #[instrument(skip(self, ctx), fields(node = self.adapter.name()))]
    async fn execute(&self, ctx: &RunContext) -> Result<Value, NodeError> {
        let report = self.adapter.run(ctx).await?;
        info!(
            "{}: {} records written, {} errors",
            self.adapter.name(),
            report.records_written,
            report.errors.len()
        );
        Ok(json!({
            "records_written": report.records_written,
            "errors": report.errors,
        }))
    }
}

/// Runs an enrichment stage as a graph node.
pub struct StageNode {
    stage: Arc<dyn EnrichmentStage>,
}

impl StageNode {
    pub fn new(stage: impl EnrichmentStage + 'static) -> Self {
        Self {
            stage: Arc::new(stage),
        }
    }
}

#[async_trait]
impl NodeAction for StageNode {
    #[instrument(skip(self, ctx), fields(node = self.stage.name()))]
    async fn execute(&self, ctx: &RunContext) -> Result<Value, NodeError> {
        let report = self.stage.run(ctx).await?;
        info!(
            "{}: {}/{} succeeded, {} failed",
            self.stage.name(),
            report.succeeded,
            report.processed,
            report.failed
        );
        let mut metadata = json!({
            "processed": report.processed,
            "succeeded": report.succeeded,
            "failed": report.failed,
        });
        if let Some(note) = report.note {
            metadata["note"] = Value::String(note);
        }
        Ok(metadata)
    }
}

/// External collaborators shared by every node. Built once per process.
#[derive(Clone)]
pub struct PipelineDeps {
    pub warehouse: SharedWarehouse,
    pub crypto_prices: Arc<dyn CryptoPriceSource>,
    pub market_caps: Arc<dyn MarketCapSource>,
    pub bars: Arc<dyn DailyBarSource>,
    pub macro_series: Arc<dyn MacroSeriesSource>,
    pub sentiment: Arc<dyn SentimentSource>,
    pub feeds: Arc<dyn FeedSource>,
    pub equity_news: Arc<dyn EquityNewsSource>,
    pub scraper: Arc<dyn ArticleScraper>,
    pub llm: Arc<dyn LanguageModel>,
    pub lock: SharedRunLock,
}

impl PipelineDeps {
    /// Production wiring: one shared `reqwest` client for every vendor.
    pub fn http(
        config: &PipelineConfig,
        warehouse: SharedWarehouse,
        lock: SharedRunLock,
    ) -> Result<Self, SourceError> {
        let client = http_client(&config.http)?;
        let yahoo = Arc::new(YahooClient::new(client.clone()));
        Ok(Self {
            warehouse,
            crypto_prices: Arc::new(BinanceClient::new(client.clone())),
            market_caps: Arc::new(CoinGeckoClient::new(client.clone())),
            bars: yahoo.clone(),
            macro_series: Arc::new(FredClient::new(client.clone(), config.api.fred_api_key.clone())),
            sentiment: Arc::new(FearGreedClient::new(client.clone())),
            feeds: Arc::new(RssClient::new(client.clone())),
            equity_news: yahoo,
            scraper: Arc::new(HttpScraper::new(client.clone())),
            llm: Arc::new(GeminiClient::new(client, config.api.gemini_api_key.clone())),
            lock,
        })
    }
}

pub fn backfill_stage(config: &PipelineConfig, deps: &PipelineDeps) -> NewsSummaryStage {
    NewsSummaryStage::new(
        SummaryScope::Backfill,
        deps.warehouse.clone(),
        deps.llm.clone(),
        deps.scraper.clone(),
        deps.lock.clone(),
        &config.enrichment,
    )
}

pub fn top_news_stage(config: &PipelineConfig, deps: &PipelineDeps) -> TopNewsStage {
    TopNewsStage::new(deps.warehouse.clone(), deps.llm.clone(), &config.enrichment.top_news_model)
}

/// The full pipeline graph. Nodes that share the market-data or model quota
/// are tagged so the executor spaces their starts.
pub fn build_graph(config: &PipelineConfig, deps: &PipelineDeps) -> Result<TaskGraph, GraphError> {
    let assets = &config.assets;
    let enrichment = &config.enrichment;
    let warehouse = &deps.warehouse;

    let binance = CryptoPriceCollector::new(
        warehouse.clone(),
        deps.crypto_prices.clone(),
        deps.market_caps.clone(),
        assets.crypto.clone(),
        Pacer::new("binance", CRYPTO_ASSET_PACING),
    );
    let macro_data = MacroCollector::new(
        warehouse.clone(),
        deps.macro_series.clone(),
        deps.bars.clone(),
        assets.macro_series.clone(),
    );
    let stocks = YahooPriceCollector::equities(
        warehouse.clone(),
        deps.bars.clone(),
        assets.equities.clone(),
        Pacer::new("yahoo equities", EQUITY_PACING),
    )
    .with_sectors(assets.sector_map());
    let commodities = YahooPriceCollector::commodities(
        warehouse.clone(),
        deps.bars.clone(),
        assets.commodities.clone(),
        Pacer::new("yahoo commodities", COMMODITY_PACING),
    );
    let sentiment = SentimentCollector::new(warehouse.clone(), deps.sentiment.clone());
    let crypto_news =
        CryptoNewsCollector::new(warehouse.clone(), deps.feeds.clone(), assets.news_feeds.clone());
    let stock_news = EquityNewsCollector::new(
        warehouse.clone(),
        deps.equity_news.clone(),
        assets.equities.clone(),
        Pacer::new("yahoo news", EQUITY_NEWS_PACING),
    );

    let macro_summary = MacroSummaryStage::new(
        warehouse.clone(),
        deps.llm.clone(),
        &enrichment.macro_model,
        Duration::from_secs(enrichment.macro_pause_secs),
    );
    let summaries = NewsSummaryStage::new(
        SummaryScope::Daily,
        warehouse.clone(),
        deps.llm.clone(),
        deps.scraper.clone(),
        deps.lock.clone(),
        enrichment,
    );
    let analysis = AssetAnalysisStage::new(
        warehouse.clone(),
        deps.llm.clone(),
        &enrichment.analysis_model,
        Pacer::new("asset analysis", Duration::from_secs(enrichment.analysis_interval_secs)),
    );
    let portfolio = PortfolioStage::new(
        warehouse.clone(),
        deps.llm.clone(),
        &enrichment.portfolio_model,
        Pacer::new("portfolio", Duration::from_secs(config.scheduler.llm_spacing_secs)),
    );

    let data = NodeGroup::DataCollection;
    let news = NodeGroup::NewsCollection;
    let ai = NodeGroup::AiAnalysis;

    let mut builder = TaskGraphBuilder::new();
    builder
        .register(NodeSpec::new(BINANCE_DATA, data, Arc::new(FetchNode::new(binance))))?
        .register(NodeSpec::new(MACRO_DATA, data, Arc::new(FetchNode::new(macro_data))).quota(QuotaGroup::Yahoo))?
        .register(
            NodeSpec::new(STOCK_DATA, data, Arc::new(FetchNode::new(stocks)))
                .depends_on([MACRO_DATA])
                .quota(QuotaGroup::Yahoo),
        )?
        .register(
            NodeSpec::new(COMMODITY_DATA, data, Arc::new(FetchNode::new(commodities)))
                .depends_on([STOCK_DATA])
                .quota(QuotaGroup::Yahoo),
        )?
        .register(NodeSpec::new(FGI_DATA, data, Arc::new(FetchNode::new(sentiment))))?
        .register(NodeSpec::new(CRYPTO_NEWS, news, Arc::new(FetchNode::new(crypto_news))))?
        .register(
            NodeSpec::new(STOCK_NEWS, news, Arc::new(FetchNode::new(stock_news)))
                .depends_on([COMMODITY_DATA])
                .quota(QuotaGroup::Yahoo),
        )?
        .register(
            NodeSpec::new(MACRO_SUMMARY, ai, Arc::new(StageNode::new(macro_summary)))
                .depends_on([STOCK_NEWS, BINANCE_DATA, CRYPTO_NEWS, FGI_DATA])
                .quota(QuotaGroup::Llm),
        )?
        .register(
            NodeSpec::new(DAILY_NEWS_SUMMARIES, ai, Arc::new(StageNode::new(summaries)))
                .depends_on([MACRO_SUMMARY])
                .quota(QuotaGroup::Llm),
        )?
        .register(
            NodeSpec::new(TOP_NEWS, ai, Arc::new(StageNode::new(top_news_stage(config, deps))))
                .depends_on([DAILY_NEWS_SUMMARIES])
                .quota(QuotaGroup::Llm),
        )?
        .register(
            NodeSpec::new(ASSET_ANALYSIS, ai, Arc::new(StageNode::new(analysis)))
                .depends_on([DAILY_NEWS_SUMMARIES])
                .quota(QuotaGroup::Llm),
        )?
        .register(
            NodeSpec::new(WEEKLY_PORTFOLIO_RECOMMENDATION, ai, Arc::new(StageNode::new(portfolio)))
                .quota(QuotaGroup::Llm),
        )?;
    builder.build()
}

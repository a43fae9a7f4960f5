use crate::collectors::{FetchAdapter, FetchReport};
use crate::database::warehouse::SharedWarehouse;
use crate::error::NodeError;
use crate::processor::job::RunContext;
use crate::sources::yahoo::yahoo_symbol;
use crate::sources::{retry_with_backoff, BackoffPolicy, EquityNewsSource, Pacer};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

pub const ARTICLES_PER_SYMBOL: usize = 5;

/// Per-ticker headlines from the finance search API.
pub struct EquityNewsCollector {
    warehouse: SharedWarehouse,
    source: Arc<dyn EquityNewsSource>,
    symbols: Vec<String>,
    policy: BackoffPolicy,
    pacer: Pacer,
}

impl EquityNewsCollector {
    pub fn new(
        warehouse: SharedWarehouse,
        source: Arc<dyn EquityNewsSource>,
        symbols: Vec<String>,
        pacer: Pacer,
    ) -> Self {
        Self {
            warehouse,
            source,
            symbols,
            policy: BackoffPolicy::yahoo(),
            pacer,
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl FetchAdapter for EquityNewsCollector {
    fn name(&self) -> &'static str {
        "stock_news"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError> {
        let mut report = FetchReport::default();
        if self.symbols.is_empty() {
            info!("No equity symbols configured for news");
            return Ok(report);
        }

        for symbol in &self.symbols {
            if ctx.is_shutting_down() {
                report.record_error(symbol, "shutdown requested before fetch");
                continue;
            }
            self.pacer.wait().await;

            let query = yahoo_symbol(symbol);
            let label = format!("news {}", query);
            let drafts = match retry_with_backoff(&label, &self.policy, || {
                self.source.news_for(&query, ARTICLES_PER_SYMBOL)
            })
            .await
            {
                Ok(drafts) => drafts,
                Err(e) => {
                    report.record_error(symbol, e);
                    continue;
                }
            };

            // one transaction per symbol
            let inserted = self.warehouse.insert_articles(&drafts).await?;
            report.records_written += inserted;
        }

        info!("Equity news complete: {} new articles", report.records_written);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryWarehouse;
    use crate::database::models::ArticleDraft;
    use crate::test_support::{run_ctx, FixedEquityNews};
    use chrono::{TimeZone, Utc};

    fn draft(url: &str, tags: &[&str]) -> ArticleDraft {
        ArticleDraft {
            url: url.to_string(),
            source: "Reuters".to_string(),
            title: format!("Headline {}", url),
            summary: None,
            published_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            related_tickers: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn shared_articles_are_stored_once() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = FixedEquityNews::default()
            .with("AAPL", vec![draft("https://x/1", &["AAPL"]), draft("https://x/2", &["AAPL", "MSFT"])])
            .with("MSFT", vec![draft("https://x/2", &["AAPL", "MSFT"])]);
        let adapter = EquityNewsCollector::new(
            warehouse.clone(),
            Arc::new(source),
            vec!["AAPL".to_string(), "MSFT".to_string(), "TSLA".to_string()],
            Pacer::disabled("test"),
        )
        .with_policy(BackoffPolicy::no_retry());

        let report = adapter.run(&run_ctx()).await.unwrap();
        assert_eq!(report.records_written, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("TSLA"));
        assert!(warehouse.article_by_url("https://x/2").is_some());
    }
}

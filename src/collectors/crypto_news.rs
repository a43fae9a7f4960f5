use crate::collectors::{FetchAdapter, FetchReport};
use crate::database::models::ArticleDraft;
use crate::database::warehouse::SharedWarehouse;
use crate::error::NodeError;
use crate::processor::job::RunContext;
use crate::sources::{retry_with_backoff, BackoffPolicy, FeedItem, FeedSource};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub const CRYPTO_TAG: &str = "CRYPTO";

/// Promotional items and descriptions that are bare link dumps.
pub fn is_spam(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("degenz") || lower.contains("http://") || lower.contains("https://")
}

fn to_draft(source: &str, item: FeedItem) -> Option<ArticleDraft> {
    let published_at = item.published_at?;
    let summary = Some(item.description).filter(|d| !d.is_empty());
    Some(ArticleDraft {
        url: item.link,
        source: source.to_string(),
        title: item.title,
        summary,
        published_at,
        related_tickers: vec![CRYPTO_TAG.to_string()],
    })
}

/// Syndication feeds from crypto news outlets.
pub struct CryptoNewsCollector {
    warehouse: SharedWarehouse,
    feeds_source: Arc<dyn FeedSource>,
    /// Source name -> feed URL.
    feeds: BTreeMap<String, String>,
    policy: BackoffPolicy,
}

impl CryptoNewsCollector {
    pub fn new(
        warehouse: SharedWarehouse,
        feeds_source: Arc<dyn FeedSource>,
        feeds: BTreeMap<String, String>,
    ) -> Self {
        Self {
            warehouse,
            feeds_source,
            feeds,
            policy: BackoffPolicy::default_http(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl FetchAdapter for CryptoNewsCollector {
    fn name(&self) -> &'static str {
        "crypto_news"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError> {
        let mut report = FetchReport::default();
        if self.feeds.is_empty() {
            info!("No news feeds configured");
            return Ok(report);
        }

        let mut drafts = Vec::new();
        for (source, url) in &self.feeds {
            let items = match retry_with_backoff(source, &self.policy, || {
                self.feeds_source.fetch_feed(url)
            })
            .await
            {
                Ok(items) => items,
                Err(e) => {
                    report.record_error(source, e);
                    continue;
                }
            };

            let total = items.len();
            let mut kept = 0;
            for item in items {
                if is_spam(&item.description) {
                    debug!("Dropping promotional item '{}'", item.title);
                    continue;
                }
                match to_draft(source, item) {
                    Some(draft) => {
                        drafts.push(draft);
                        kept += 1;
                    }
                    None => debug!("Dropping undated item from {}", source),
                }
            }
            info!("{}: kept {} of {} items", source, kept, total);
        }

        report.records_written = self.warehouse.insert_articles(&drafts).await?;
        info!("News fetch complete. {} new articles inserted.", report.records_written);
        Ok(report)
    }
}

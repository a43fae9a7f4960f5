use crate::collectors::{FetchAdapter, FetchReport};
use crate::database::warehouse::SharedWarehouse;
use crate::error::NodeError;
use crate::processor::job::RunContext;
use crate::sources::{retry_with_backoff, BackoffPolicy, SentimentSource};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument};

pub const HISTORY_LIMIT: usize = 100;

/// Crypto fear & greed index.
pub struct SentimentCollector {
    warehouse: SharedWarehouse,
    source: Arc<dyn SentimentSource>,
    policy: BackoffPolicy,
}

impl SentimentCollector {
    pub fn new(warehouse: SharedWarehouse, source: Arc<dyn SentimentSource>) -> Self {
        Self {
            warehouse,
            source,
            policy: BackoffPolicy::default_http(),
        }
    }

    pub fn with_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl FetchAdapter for SentimentCollector {
    fn name(&self) -> &'static str {
        "fgi_data"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id))]
    async fn run(&self, ctx: &RunContext) -> Result<FetchReport, NodeError> {
        let mut report = FetchReport::default();
        let points = match retry_with_backoff("fear_greed", &self.policy, || {
            self.source.recent(HISTORY_LIMIT)
        })
        .await
        {
            Ok(points) => points,
            Err(e) => {
                report.record_error("fear_greed", e);
                return Ok(report);
            }
        };

        let valid: Vec<_> = points
            .into_iter()
            .filter(|p| match p.validate() {
                Ok(()) => true,
                Err(reason) => {
                    report.record_error(&p.date.to_string(), reason);
                    false
                }
            })
            .collect();

        report.records_written = self.warehouse.insert_sentiment(&valid).await?;
        info!("FGI fetch complete: {} new records", report.records_written);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryWarehouse;
    use crate::database::models::SentimentPoint;
    use crate::test_support::{run_ctx, FixedSentiment};
    use chrono::NaiveDate;

    fn point(day: u32, value: i32) -> SentimentPoint {
        SentimentPoint {
            date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            value,
            classification: "Greed".to_string(),
        }
    }

    #[tokio::test]
    async fn out_of_range_values_are_rejected() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let source = FixedSentiment(vec![point(1, 55), point(2, 140), point(3, 61)]);
        let adapter = SentimentCollector::new(warehouse.clone(), Arc::new(source))
            .with_policy(BackoffPolicy::no_retry());

        let report = adapter.run(&run_ctx()).await.unwrap();
        assert_eq!(report.records_written, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(warehouse.sentiment_for(point(2, 0).date).is_none());

        // second run keeps the first values
        let again = adapter.run(&run_ctx()).await.unwrap();
        assert_eq!(again.records_written, 0);
    }
}

use crate::cache::{acquire_with_wait, SharedRunLock, NEWS_SUMMARIES_LOCK};
use crate::config::EnrichmentConfig;
use crate::database::models::NewsArticle;
use crate::database::warehouse::{SharedWarehouse, MIN_SUMMARY_LEN};
use crate::enrichment::decoder::decode_summaries;
use crate::enrichment::{ask_structured, EnrichmentStage, StageReport};
use crate::error::NodeError;
use crate::processor::job::RunContext;
use crate::sources::{ArticleScraper, LanguageModel};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use futures::stream::{self, StreamExt};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const LOCK_TTL: Duration = Duration::from_secs(6 * 3600);
const LOCK_POLL: Duration = Duration::from_secs(30);

/// Which part of the backlog a run works through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryScope {
    /// Articles published since the day before the run date.
    Daily,
    /// Every article still missing a summary.
    Backfill,
}

struct ScrapedArticle {
    article_id: i64,
    title: String,
    body: String,
}

/// Scrapes article bodies and asks the model for short summaries in batches.
pub struct NewsSummaryStage {
    scope: SummaryScope,
    warehouse: SharedWarehouse,
    llm: Arc<dyn LanguageModel>,
    scraper: Arc<dyn ArticleScraper>,
    lock: SharedRunLock,
    model: String,
    batch_size: usize,
    concurrency: usize,
    pause: Duration,
    lock_wait: Duration,
}

impl NewsSummaryStage {
    pub fn new(
        scope: SummaryScope,
        warehouse: SharedWarehouse,
        llm: Arc<dyn LanguageModel>,
        scraper: Arc<dyn ArticleScraper>,
        lock: SharedRunLock,
        config: &EnrichmentConfig,
    ) -> Self {
        let concurrency = match scope {
            SummaryScope::Daily => config.scrape_concurrency,
            SummaryScope::Backfill => config.backfill_scrape_concurrency,
        };
        Self {
            scope,
            warehouse,
            llm,
            scraper,
            lock,
            model: config.summary_model.clone(),
            batch_size: config.news_batch_size.max(1),
            concurrency: concurrency.max(1),
            pause: Duration::from_secs(config.news_batch_pause_secs),
            lock_wait: Duration::from_secs(config.summarizer_lock_wait_secs),
        }
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    async fn scrape(&self, batch: &[NewsArticle]) -> Vec<ScrapedArticle> {
        let owned = batch.iter().cloned().enumerate();
        let mut scraped: Vec<(usize, ScrapedArticle)> = stream::iter(owned)
            .map(|(index, article)| async move {
                match self.scraper.body_text(&article.url).await {
                    Ok(body) => Some((
                        index,
                        ScrapedArticle {
                            article_id: article.article_id,
                            title: article.title,
                            body,
                        },
                    )),
                    Err(e) => {
                        warn!("Failed to scrape '{}': {}", article.url, e);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(|result| async move { result })
            .collect()
            .await;
        scraped.sort_by_key(|(index, _)| *index);
        scraped.into_iter().map(|(_, article)| article).collect()
    }

    async fn summarize(&self, ctx: &RunContext) -> Result<StageReport, NodeError> {
        let since = match self.scope {
            SummaryScope::Daily => Some(daily_window_start(ctx.run_date)),
            SummaryScope::Backfill => None,
        };
        let backlog = self.warehouse.unsummarized_articles(since).await?;
        if backlog.is_empty() {
            info!("All articles already have summaries - skipping AI generation");
            return Ok(StageReport::noted("all articles already summarized"));
        }
        info!("Found {} articles without summaries", backlog.len());

        let mut report = StageReport::default();
        let batches: Vec<&[NewsArticle]> = backlog.chunks(self.batch_size).collect();
        for (i, batch) in batches.iter().enumerate() {
            if ctx.is_shutting_down() {
                report.note = Some("interrupted by shutdown".to_string());
                break;
            }
            if i > 0 && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }

            report.processed += batch.len() as u64;
            let scraped = self.scrape(batch).await;
            report.failed += (batch.len() - scraped.len()) as u64;
            if scraped.is_empty() {
                continue;
            }

            let prompt = summary_prompt(&scraped);
            let label = format!("summary batch {}", i + 1);
            let summaries = match ask_structured(self.llm.as_ref(), &self.model, &prompt, &label, |raw| {
                decode_summaries(raw, scraped.len())
            })
            .await
            {
                Ok(summaries) => summaries,
                Err(e) => {
                    warn!("Batch AI generation failed: {}", e);
                    report.failed += scraped.len() as u64;
                    continue;
                }
            };

            let updates: Vec<(i64, String)> = scraped
                .iter()
                .zip(summaries)
                .filter(|(_, summary)| summary.chars().count() >= MIN_SUMMARY_LEN)
                .map(|(article, summary)| (article.article_id, summary))
                .collect();
            let written = self.warehouse.update_summaries(&updates).await?;
            report.succeeded += written;
            report.failed += scraped.len() as u64 - written;
            info!(
                "[{}/{}] Batch of {} articles summarized",
                report.processed,
                backlog.len(),
                written
            );
        }

        info!(
            "News summaries complete: processed {}, succeeded {}, failed {}",
            report.processed, report.succeeded, report.failed
        );
        Ok(report)
    }
}

fn summary_prompt(articles: &[ScrapedArticle]) -> String {
    let mut prompt = format!(
        "Summarize each of these {} financial news articles in 2-3 concise sentences.\n\
         Focus on key facts, market impact, and actionable insights.\n\n",
        articles.len()
    );
    for (i, article) in articles.iter().enumerate() {
        let _ = write!(
            prompt,
            "Article {}:\nTitle: {}\nContent: {}\n\n---\n",
            i + 1,
            article.title,
            article.body
        );
    }
    prompt.push_str(
        "\nReturn ONLY a JSON array with one summary string per article, in the same order.\n\
         No extra formatting, just the JSON array.\n",
    );
    prompt
}

#[async_trait]
impl EnrichmentStage for NewsSummaryStage {
    fn name(&self) -> &'static str {
        match self.scope {
            SummaryScope::Daily => "daily_news_summaries",
            SummaryScope::Backfill => "backfill_news_summaries",
        }
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id, scope = ?self.scope))]
    async fn run(&self, ctx: &RunContext) -> Result<StageReport, NodeError> {
        let token = acquire_with_wait(
            self.lock.as_ref(),
            NEWS_SUMMARIES_LOCK,
            LOCK_TTL,
            self.lock_wait,
            LOCK_POLL.min(self.lock_wait.max(Duration::from_secs(1))),
        )
        .await?;

        let result = self.summarize(ctx).await;

        if let Err(e) = self.lock.release(&token).await {
            warn!("Failed to release '{}': {}", NEWS_SUMMARIES_LOCK, e);
        }
        result
    }
}

/// First publication date the daily scope looks at.
pub fn daily_window_start(run_date: chrono::NaiveDate) -> chrono::NaiveDate {
    run_date - ChronoDuration::days(1)
}

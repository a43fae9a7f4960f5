use crate::database::models::{NewsArticle, TopNewsEntry};
use crate::database::warehouse::SharedWarehouse;
use crate::enrichment::decoder::decode_top_news;
use crate::enrichment::{ask_structured, EnrichmentStage, StageReport};
use crate::error::NodeError;
use crate::processor::job::RunContext;
use crate::sources::LanguageModel;
use async_trait::async_trait;
use chrono::{NaiveTime, TimeZone, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const TOP_NEWS_COUNT: usize = 5;

/// Picks the day's five most market-moving stories.
pub struct TopNewsStage {
    warehouse: SharedWarehouse,
    llm: Arc<dyn LanguageModel>,
    model: String,
    force: bool,
}

impl TopNewsStage {
    pub fn new(warehouse: SharedWarehouse, llm: Arc<dyn LanguageModel>, model: &str) -> Self {
        Self {
            warehouse,
            llm,
            model: model.to_string(),
            force: false,
        }
    }

    /// Regenerate even when the day already has a ranking.
    pub fn forced(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

fn ranking_prompt(articles: &[NewsArticle]) -> String {
    let mut listing = String::new();
    for (i, article) in articles.iter().enumerate() {
        let _ = write!(
            listing,
            "\nArticle {}:\nTitle: {}\nSummary: {}\nSource: {}\nDate: {}\n---\n",
            i + 1,
            article.title,
            article.summary.as_deref().unwrap_or_default(),
            article.source,
            article.date()
        );
    }

    format!(
        "You are the Chief Investment Officer of a global macro fund covering equities, \
commodities and crypto. Identify the {count} most critical narratives driving global \
liquidity and risk sentiment today.

Priority, highest first:
1. Systemic macro: central bank policy, inflation prints, geopolitical supply shocks, global systemic events.
2. Market leaders: mega-cap technology earnings or Bitcoin/Ethereum infrastructure news.
3. Commodity shocks: supply disruptions in oil, gold or critical metals.
4. Sector specific: regulatory changes or large M&A.

Rules:
- Do not let one asset class dominate unless the event is systemic.
- Select exactly {count} articles, most important first.

NEWS ARTICLES (last 24 hours):
{listing}
Return ONLY a JSON object of the form
{{\"top_news\": [{{\"article_number\": 3, \"importance_score\": 10}}, ...]}}
with exactly {count} entries. importance_score runs from 1 to 10, 10 being the highest impact.",
        count = TOP_NEWS_COUNT,
        listing = listing
    )
}

#[async_trait]
impl EnrichmentStage for TopNewsStage {
    fn name(&self) -> &'static str {
        "top_news"
    }

    #[instrument(skip(self, ctx), fields(run_id = %ctx.run_id, force = self.force))]
    async fn run(&self, ctx: &RunContext) -> Result<StageReport, NodeError> {
        let date = ctx.run_date;
        if !self.force && self.warehouse.top_news_exists(date).await? {
            info!("Top news already generated for {} - skipping", date);
            return Ok(StageReport::noted("ranking already exists"));
        }

        let window_start = date
            .pred_opt()
            .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
            .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)));
        let articles = self.warehouse.summarized_articles_since(window_start).await?;
        if articles.len() < TOP_NEWS_COUNT {
            warn!(
                "Only {} summarized articles found - need at least {} for selection",
                articles.len(),
                TOP_NEWS_COUNT
            );
            return Ok(StageReport {
                processed: articles.len() as u64,
                note: Some(format!("declined: {} qualifying articles", articles.len())),
                ..Default::default()
            });
        }
        info!("Ranking {} articles from the last 24 hours", articles.len());

        let prompt = ranking_prompt(&articles);
        let ranked = ask_structured(self.llm.as_ref(), &self.model, &prompt, "top news", |raw| {
            decode_top_news(raw, articles.len(), TOP_NEWS_COUNT)
        })
        .await?;

        let entries: Vec<TopNewsEntry> = ranked
            .iter()
            .enumerate()
            .map(|(rank, pick)| TopNewsEntry {
                date,
                article_id: articles[pick.article_number - 1].article_id,
                importance_score: pick.importance_score,
                rank_position: rank as i32 + 1,
                model_name: self.model.clone(),
            })
            .collect();
        self.warehouse.replace_top_news(date, &entries).await?;

        for (entry, pick) in entries.iter().zip(&ranked) {
            info!(
                "#{} (Score: {}/10) - {}",
                entry.rank_position,
                entry.importance_score,
                articles[pick.article_number - 1].title
            );
        }

        Ok(StageReport {
            processed: articles.len() as u64,
            succeeded: entries.len() as u64,
            failed: 0,
            note: None,
        })
    }
}

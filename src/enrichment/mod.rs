//! AI enrichment stages. Stages read their inputs from storage and write
//! their results back; nothing is passed between stages directly.

pub mod asset_analysis;
pub mod decoder;
pub mod macro_summary;
pub mod news_summaries;
pub mod portfolio;
pub mod top_news;

use crate::error::{DecodeError, NodeError, SourceError};
use crate::processor::job::RunContext;
use crate::sources::LanguageModel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub use self::asset_analysis::AssetAnalysisStage;
pub use self::macro_summary::MacroSummaryStage;
pub use self::news_summaries::{NewsSummaryStage, SummaryScope};
pub use self::portfolio::PortfolioStage;
pub use self::top_news::TopNewsStage;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StageReport {
    pub fn noted(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait EnrichmentStage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &RunContext) -> Result<StageReport, NodeError>;
}

/// Attempts per structured request: the first try plus one retry.
pub const STRUCTURED_ATTEMPTS: u32 = 2;

/// Why a structured request ended without a usable value.
#[derive(Debug, Error)]
pub enum AskError {
    #[error(transparent)]
    Model(#[from] SourceError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<AskError> for NodeError {
    fn from(e: AskError) -> Self {
        match e {
            AskError::Model(e) => e.into(),
            AskError::Decode(e) => e.into(),
        }
    }
}

/// Sends `prompt` and decodes the reply, repeating the same request once when
/// the call or the decode fails.
pub async fn ask_structured<T, D>(
    llm: &dyn LanguageModel,
    model: &str,
    prompt: &str,
    label: &str,
    decode: D,
) -> Result<T, AskError>
where
    D: Fn(&str) -> Result<T, DecodeError>,
{
    let mut last = None;
    for attempt in 1..=STRUCTURED_ATTEMPTS {
        let error = match llm.generate(model, prompt).await {
            Ok(raw) => match decode(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => AskError::Decode(e),
            },
            Err(e) => AskError::Model(e),
        };
        warn!("{}: attempt {}/{} failed: {}", label, attempt, STRUCTURED_ATTEMPTS, error);
        last = Some(error);
    }
    Err(last.unwrap_or_else(|| AskError::Decode(DecodeError::Unparseable(String::new()))))
}

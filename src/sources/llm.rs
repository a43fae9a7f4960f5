use crate::error::SourceError;
use crate::sources::{get_json, retry_with_backoff, BackoffPolicy, Pacer};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Text-in/text-out language model.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, SourceError>;
}

pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    policy: BackoffPolicy,
}

impl GeminiClient {
    pub fn new(client: Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            policy: BackoffPolicy::default_http(),
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate.
    pub fn text(self) -> Result<String, SourceError> {
        let text: String = self
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|content| content.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(SourceError::Empty("model response".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, SourceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(SourceError::MissingCredential("GEMINI_API_KEY"))?;
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let body = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };
        debug!("prompting {} with {} chars", model, prompt.len());

        let response: GenerateResponse = retry_with_backoff(model, &self.policy, || {
            let request = self
                .client
                .post(&url)
                .query(&[("key", api_key)])
                .json(&body);
            get_json(request, "gemini")
        })
        .await?;
        response.text()
    }
}

/// Wraps a model so that every call waits for its [`Pacer`] slot first.
pub struct PacedModel {
    inner: Arc<dyn LanguageModel>,
    pacer: Pacer,
}

impl PacedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, pacer: Pacer) -> Self {
        Self { inner, pacer }
    }
}

#[async_trait]
impl LanguageModel for PacedModel {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, SourceError> {
        self.pacer.wait().await;
        self.inner.generate(model, prompt).await
    }
}

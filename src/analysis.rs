//! Downstream analysis collaborator.
//!
//! Once a settlement is verified the gateway hands the product record and
//! the requested task to an [`AnalysisClient`]. The HTTP client speaks the
//! `generateContent` JSON shape: one user turn in, the first candidate's
//! first text part out.

use crate::catalog::CatalogEntry;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Mode label used when the caller names none.
pub const DEFAULT_MODE: &str = "analysis";

const PROFITABILITY: &str = "Analyze profitability";
const SENTIMENT: &str = "Analyze sentiment";
const MARKETING: &str = "Generate marketing ideas";
const CUSTOM: &str = "Custom research";

/// What the caller asked the collaborator to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisTask {
    /// Short profitability analysis.
    Profitability,
    /// Customer sentiment and risks.
    Sentiment,
    /// Marketing ideas.
    Marketing,
    /// Free-form question answered from the product data only.
    Custom(String),
    /// Any other task, passed through verbatim.
    Other(String),
}

impl AnalysisTask {
    /// Interpret a mode label.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for custom research without a query.
    pub fn from_mode(mode: Option<&str>, custom_query: Option<&str>) -> Result<Self> {
        let mode = mode.map(str::trim).filter(|m| !m.is_empty()).unwrap_or(DEFAULT_MODE);
        match mode {
            PROFITABILITY => Ok(Self::Profitability),
            SENTIMENT => Ok(Self::Sentiment),
            MARKETING => Ok(Self::Marketing),
            CUSTOM => custom_query
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(|q| Self::Custom(q.to_string()))
                .ok_or_else(|| Error::BadRequest("Custom research query is empty".to_string())),
            other => Ok(Self::Other(other.to_string())),
        }
    }

    /// Mode label, as sent on the ledger and echoed to the caller.
    #[must_use]
    pub fn label(&self) -> &str {
        match self {
            Self::Profitability => PROFITABILITY,
            Self::Sentiment => SENTIMENT,
            Self::Marketing => MARKETING,
            Self::Custom(_) => CUSTOM,
            Self::Other(label) => label,
        }
    }
}

/// Render the prompt for `task` over `entry`.
#[must_use]
pub fn build_prompt(task: &AnalysisTask, entry: &CatalogEntry) -> String {
    let product = serde_json::to_string_pretty(entry).unwrap_or_else(|_| entry.title.clone());
    let instruction = match task {
        AnalysisTask::Profitability => "Give a short profitability analysis.".to_string(),
        AnalysisTask::Sentiment => "Analyze customer sentiment and risks.".to_string(),
        AnalysisTask::Marketing => "Generate marketing ideas for this product.".to_string(),
        AnalysisTask::Custom(query) => format!(
            "User custom request:\n{query}\n\nRules:\n- Use ONLY the product data\n- Be concise\n- No filler"
        ),
        AnalysisTask::Other(label) => format!("User task: {label}"),
    };
    format!("{instruction}\n\nProduct:\n{product}\n")
}

/// Produces an analysis of a product.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Run `task` over `entry`.
    ///
    /// # Errors
    ///
    /// Returns `AnalysisFailed` on any collaborator failure, including timeouts.
    async fn analyze(&self, task: &AnalysisTask, entry: &CatalogEntry) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()?
            .content
            .parts
            .into_iter()
            .next()?
            .text
    }
}

/// `generateContent` client.
pub struct HttpAnalysisClient {
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
    http_client: reqwest::Client,
}

impl HttpAnalysisClient {
    /// Create a client posting to `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the HTTP client cannot be built.
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("agentpay-node/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("Analysis HTTP client: {e}")))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            api_key,
            timeout,
            http_client,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let body = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: prompt }],
            }],
        };

        let mut request = self.http_client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!("Analysis request failed: {e}");
                Error::AnalysisFailed("collaborator unavailable".to_string())
            })?;

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            warn!("Malformed analysis response: {e}");
            Error::AnalysisFailed("malformed collaborator response".to_string())
        })?;

        parsed
            .first_text()
            .ok_or_else(|| Error::AnalysisFailed("collaborator returned no candidates".to_string()))
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn analyze(&self, task: &AnalysisTask, entry: &CatalogEntry) -> Result<String> {
        let prompt = build_prompt(task, entry);
        debug!(
            "Requesting '{}' analysis for product {} ({} prompt bytes)",
            task.label(),
            entry.id,
            prompt.len()
        );

        tokio::time::timeout(self.timeout, self.generate(&prompt))
            .await
            .map_err(|_| {
                Error::AnalysisFailed(format!("timed out after {}s", self.timeout.as_secs()))
            })?
    }
}

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::LlmConfig;
use crate::error::FilterError;
use crate::llm::{ChatMessage, LlmClient};

/// Classifier decision for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject,
}

/// Decides whether a batch's text is worth forwarding
#[async_trait]
pub trait RelevanceFilter: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Verdict, FilterError>;
}

/// Relevance filter backed by a chat-completions model
pub struct LlmRelevanceFilter {
    llm: LlmClient,
    prompt: String,
}

impl LlmRelevanceFilter {
    pub fn new(config: LlmConfig) -> Self {
        let prompt = config.prompt.clone();
        Self {
            llm: LlmClient::new(config),
            prompt,
        }
    }

    fn render_prompt(&self, text: &str) -> String {
        self.prompt.replace("{content}", text)
    }
}

#[async_trait]
impl RelevanceFilter for LlmRelevanceFilter {
    async fn classify(&self, text: &str) -> Result<Verdict, FilterError> {
        // Media without a caption has nothing to judge
        if text.trim().is_empty() {
            debug!("Empty content, accepting without classification");
            return Ok(Verdict::Accept);
        }

        let preview: String = text.chars().take(50).collect();
        debug!("Classifying with {}: {}...", self.llm.model(), preview);

        let response = self
            .llm
            .complete(&[ChatMessage::user(self.render_prompt(text))])
            .await
            .map_err(|e| FilterError::Request(format!("{:#}", e)))?;

        info!("Classifier response: {}", response.trim());
        parse_verdict(&response)
    }
}

/// Read a True/False answer, tolerating models that add words around it.
pub fn parse_verdict(response: &str) -> Result<Verdict, FilterError> {
    let normalized = response.trim().trim_matches(|c: char| c == '.' || c == '"' || c == '\'');
    let normalized = normalized.to_lowercase();

    match normalized.as_str() {
        "true" => return Ok(Verdict::Accept),
        "false" => return Ok(Verdict::Reject),
        _ => {}
    }

    match (normalized.contains("true"), normalized.contains("false")) {
        (true, false) => {
            warn!("Ambiguous classifier response, reading as True: {}", response);
            Ok(Verdict::Accept)
        }
        (false, true) => {
            warn!("Ambiguous classifier response, reading as False: {}", response);
            Ok(Verdict::Reject)
        }
        _ => Err(FilterError::Unparseable(response.to_string())),
    }
}

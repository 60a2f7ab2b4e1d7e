//! OpenAI-compatible chat-completions client implementing both capabilities.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;
use crate::db::models::{Approach, ProviderKind};
use crate::engine::types::{GeneratedFile, GeneratedOutput, GenerationRequest, GenerationStrategy};
use crate::error::AppError;

use super::extract::parse_typed;
use super::{FixGenerationCapability, FixProposal, FixRequest, GenerationCapability};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Typed shape the generation model must answer with.
#[derive(Debug, Deserialize)]
struct FilesAnswer {
    files: Vec<GeneratedFile>,
    #[serde(default)]
    notes: Option<String>,
}

// ============================================================================
// HttpProvider
// ============================================================================

pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: ProviderConfig,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, AppError> {
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| AppError::Config("provider.base_url is not set".into()))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            config: config.clone(),
        })
    }

    fn model_for(&self, provider: ProviderKind) -> &str {
        match provider {
            ProviderKind::Flagship => &self.config.flagship_model,
            ProviderKind::Standard => &self.config.standard_model,
            ProviderKind::Fast => &self.config.fast_model,
        }
    }

    /// Send one chat completion and return the assistant text.
    async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
        timeout: Duration,
    ) -> Result<String, AppError> {
        let body = ChatRequest {
            model,
            messages: vec![
                ChatMessage { role: "system", content: system },
                ChatMessage { role: "user", content: user },
            ],
            temperature: 0.2,
        };

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(timeout)
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp: ChatResponse = req
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| AppError::ProviderResponse(format!("invalid completion body: {e}")))?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::ProviderResponse("completion had no content".into()))
    }
}

fn approach_instructions(approach: Approach) -> &'static str {
    match approach {
        Approach::Progressive => {
            "Build the application incrementally: scaffold, core features, then polish."
        }
        Approach::Simple => "Produce the smallest complete working application.",
        Approach::Hybrid => "Produce a working core first, then add the most important extras.",
    }
}

#[async_trait]
impl GenerationCapability for HttpProvider {
    async fn generate(
        &self,
        strategy: &GenerationStrategy,
        request: &GenerationRequest,
    ) -> Result<GeneratedOutput, AppError> {
        let system = format!(
            "You generate complete application source code. {} \
             Answer with a ```json block: {{\"files\": [{{\"path\": string, \"content\": string}}], \"notes\": string}}.",
            approach_instructions(strategy.approach)
        );
        let user = match &request.context {
            Some(ctx) if request.has_context() => format!("{}\n\nContext:\n{}", request.text, ctx),
            _ => request.text.clone(),
        };

        let text = self
            .complete(
                self.model_for(strategy.provider),
                &system,
                &user,
                Duration::from_millis(strategy.timeout_ms),
            )
            .await?;

        let answer: FilesAnswer = parse_typed(&text, &["files"])?;
        tracing::debug!(
            provider = %strategy.provider,
            files = answer.files.len(),
            "Parsed generation answer"
        );

        Ok(GeneratedOutput {
            files: answer.files,
            metadata: serde_json::json!({
                "model": self.model_for(strategy.provider),
                "notes": answer.notes,
            }),
        })
    }
}

#[async_trait]
impl FixGenerationCapability for HttpProvider {
    async fn propose_fix(&self, request: &FixRequest) -> Result<FixProposal, AppError> {
        let system = "You repair failing code. Answer with a ```json block: \
             {\"fixed_code\": string, \"explanation\": string, \"confidence\": number between 0 and 1}.";
        let user = format!(
            "Error type: {}\nMessage: {}\nStack trace: {}\n\nCode:\n{}",
            request.error_type,
            request.message,
            request.stack_trace.as_deref().unwrap_or("(none)"),
            request.original_code,
        );

        let text = self
            .complete(
                &self.config.fix_model,
                system,
                &user,
                Duration::from_millis(self.config.fix_timeout_ms),
            )
            .await?;

        parse_typed::<FixProposal>(&text, &["fixed_code", "fixedCode"])?.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_base_url() {
        let cfg = ProviderConfig::default();
        assert!(matches!(HttpProvider::new(&cfg), Err(AppError::Config(_))));
    }

    #[test]
    fn test_model_routing() {
        let cfg = ProviderConfig {
            base_url: Some("http://localhost:1234/v1/".into()),
            ..ProviderConfig::default()
        };
        let p = HttpProvider::new(&cfg).unwrap();
        assert_eq!(p.base_url, "http://localhost:1234/v1");
        assert_eq!(p.model_for(ProviderKind::Fast), cfg.fast_model);
        assert_eq!(p.model_for(ProviderKind::Flagship), cfg.flagship_model);
    }

    #[test]
    fn test_files_answer_schema() {
        let text = "```json\n{\"files\": [{\"path\": \"index.html\", \"content\": \"<h1>hi</h1>\"}]}\n```";
        let answer: FilesAnswer = parse_typed(text, &["files"]).unwrap();
        assert_eq!(answer.files.len(), 1);
        assert!(answer.notes.is_none());
    }
}

//! Context-grounded answers: prompt assembly over retrieved chunks and an
//! injected [`CompletionService`].
//!
//! The generator never invents context. With no retrieved hits it answers
//! that nothing relevant was found without calling the service; otherwise
//! the prompt restricts the model to the numbered excerpts and the answer
//! always carries the source list.

use anyhow::{bail, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::CompletionConfig;
use crate::error::CompletionServiceError;
use crate::models::{ArtifactKind, RetrievalResult};
use crate::query::{analyze_query, Intent, QueryAnalysis};

/// One prompt for a chat-style model.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Text generation backend. Never retried internally.
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;
}

/// Build the service selected by `completion.provider`, or `None` when
/// completions are disabled.
pub fn create_completion_service(
    config: &CompletionConfig,
) -> Result<Option<Arc<dyn CompletionService>>> {
    match config.provider.as_str() {
        "disabled" => Ok(None),
        "openai" => Ok(Some(Arc::new(OpenAICompletion::new(config)?))),
        "ollama" => Ok(Some(Arc::new(OllamaCompletion::new(config)?))),
        other => bail!("Unknown completion provider: {}", other),
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

fn chat_messages(request: &CompletionRequest) -> [ChatMessage<'_>; 2] {
    [
        ChatMessage {
            role: "system",
            content: &request.system,
        },
        ChatMessage {
            role: "user",
            content: &request.user,
        },
    ]
}

async fn send_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| CompletionServiceError::Request(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CompletionServiceError::Status {
            status: status.as_u16(),
            body,
        }
        .into());
    }

    let parsed = response
        .json::<T>()
        .await
        .map_err(|e| CompletionServiceError::InvalidResponse(e.to_string()))?;
    Ok(parsed)
}

// ============ OpenAI ============

/// `POST /chat/completions` on the OpenAI API. Requires `OPENAI_API_KEY`.
pub struct OpenAICompletion {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage<'a>],
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OpenAIChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAICompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let messages = chat_messages(request);
        let body = OpenAIChatRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: request.max_tokens,
        };

        let response: OpenAIChatResponse = send_json(
            self.client
                .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body),
        )
        .await?;

        let choice = response.choices.into_iter().next().ok_or_else(|| {
            CompletionServiceError::InvalidResponse("response has no choices".into())
        })?;
        Ok(Completion {
            text: choice.message.content.unwrap_or_default(),
            model: response.model.unwrap_or_else(|| self.model.clone()),
            finish_reason: choice.finish_reason,
        })
    }
}

// ============ Ollama ============

/// `POST /api/chat` on a local Ollama instance (default `http://localhost:11434`).
pub struct OllamaCompletion {
    client: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage<'a>],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    model: Option<String>,
    message: OllamaMessage,
    #[serde(default)]
    done_reason: Option<String>,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

impl OllamaCompletion {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
        })
    }
}

#[async_trait]
impl CompletionService for OllamaCompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let messages = chat_messages(request);
        let body = OllamaChatRequest {
            model: &self.model,
            messages: &messages,
            stream: false,
            options: OllamaOptions {
                num_predict: request.max_tokens,
            },
        };

        let response: OllamaChatResponse = send_json(
            self.client
                .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
                .header("Content-Type", "application/json")
                .json(&body),
        )
        .await?;

        Ok(Completion {
            text: response.message.content,
            model: response.model.unwrap_or_else(|| self.model.clone()),
            finish_reason: response.done_reason,
        })
    }
}

// ============ Response generation ============

const NO_CONTEXT_ANSWER: &str =
    "No relevant context was found in the repository for this question.";

const BASE_SYSTEM_PROMPT: &str = "You answer questions about a source code repository. \
Use only the numbered context excerpts supplied with the question. \
Cite excerpts by their number, for example [2]. \
If the excerpts do not contain the answer, say so plainly instead of guessing.";

fn intent_guidance(intent: Intent) -> &'static str {
    match intent {
        Intent::Api => "Describe signatures, parameters and return values exactly as they appear in the code.",
        Intent::Setup => "List installation steps, required configuration and environment variables.",
        Intent::Code => "Quote the relevant code and explain how it works.",
        Intent::Documentation => "Summarize the relevant documentation clearly and concisely.",
    }
}

static EXCESS_NEWLINES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("Invalid regex"));

static FENCED_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```[^\n]*\n(.*?)\n?```").expect("Invalid regex"));

/// A retrieved chunk cited by an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub chunk_id: String,
    pub path: String,
    pub start_line: i64,
    pub end_line: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedResponse {
    pub answer: String,
    pub sources: Vec<Source>,
    pub intents: Vec<Intent>,
    /// `None` when no completion was requested.
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    /// Fenced code blocks in the answer, for code questions.
    pub code_snippets: Vec<String>,
    /// Environment variables referenced by the context, for setup questions.
    pub env_vars: Vec<String>,
}

pub struct ResponseGenerator {
    service: Option<Arc<dyn CompletionService>>,
    max_tokens: u32,
}

impl ResponseGenerator {
    pub fn new(service: Option<Arc<dyn CompletionService>>, max_tokens: u32) -> Self {
        Self {
            service,
            max_tokens,
        }
    }

    pub fn from_config(config: &CompletionConfig) -> Result<Self> {
        Ok(Self::new(
            create_completion_service(config)?,
            config.max_tokens,
        ))
    }

    pub fn build_prompt(
        &self,
        query: &str,
        analysis: &QueryAnalysis,
        context: &RetrievalResult,
    ) -> CompletionRequest {
        let mut system = BASE_SYSTEM_PROMPT.to_string();
        for intent in &analysis.intents {
            system.push_str("\n\n");
            system.push_str(intent_guidance(*intent));
        }

        let mut user = format!("Question: {}\n\nContext:\n", query.trim());
        for (i, hit) in context.iter().enumerate() {
            let r = &hit.record;
            let lang = if r.kind == ArtifactKind::Code {
                r.language.as_str()
            } else {
                ""
            };
            user.push_str(&format!(
                "\n[{}] {} (lines {}-{})\n```{}\n{}\n```\n",
                i + 1,
                r.path,
                r.start_line,
                r.end_line,
                lang,
                r.text.trim_end()
            ));
        }
        user.push_str(
            "\nAnswer using only the context above. If it is insufficient, say which information is missing.",
        );

        CompletionRequest {
            system,
            user,
            max_tokens: self.max_tokens,
        }
    }

    /// Answer `query` from the already retrieved `context`.
    ///
    /// Fails with [`CompletionServiceError::Disabled`] when context exists
    /// but no completion service is configured.
    pub async fn generate(&self, query: &str, context: &RetrievalResult) -> Result<GeneratedResponse> {
        let analysis = analyze_query(query);
        let sources = sources(context);
        let env_vars = if analysis.has_intent(Intent::Setup) {
            context_env_vars(context)
        } else {
            Vec::new()
        };

        if context.is_empty() {
            return Ok(GeneratedResponse {
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources,
                intents: analysis.intents,
                model: None,
                finish_reason: None,
                code_snippets: Vec::new(),
                env_vars,
            });
        }

        let service = self
            .service
            .as_ref()
            .ok_or(CompletionServiceError::Disabled)?;
        let request = self.build_prompt(query, &analysis, context);
        let completion = service.complete(&request).await?;
        tracing::debug!(
            model = %completion.model,
            chars = completion.text.len(),
            "completion received"
        );

        let answer = with_citations(&format_answer(&completion.text), &sources);
        let code_snippets = if analysis.has_intent(Intent::Code) {
            code_snippets(&answer)
        } else {
            Vec::new()
        };

        Ok(GeneratedResponse {
            answer,
            sources,
            intents: analysis.intents,
            model: Some(completion.model),
            finish_reason: completion.finish_reason,
            code_snippets,
            env_vars,
        })
    }
}

fn sources(context: &RetrievalResult) -> Vec<Source> {
    context
        .iter()
        .map(|hit| Source {
            chunk_id: hit.record.chunk_id.clone(),
            path: hit.record.path.clone(),
            start_line: hit.record.start_line,
            end_line: hit.record.end_line,
        })
        .collect()
}

fn context_env_vars(context: &RetrievalResult) -> Vec<String> {
    let names: BTreeSet<&str> = context
        .iter()
        .flat_map(|hit| hit.record.env_vars.iter().map(String::as_str))
        .collect();
    names.into_iter().map(str::to_string).collect()
}

fn format_answer(answer: &str) -> String {
    EXCESS_NEWLINES
        .replace_all(answer.trim(), "\n\n")
        .into_owned()
}

/// Append a source list unless the answer already names a source path.
fn with_citations(answer: &str, sources: &[Source]) -> String {
    if sources.is_empty() || sources.iter().any(|s| answer.contains(&s.path)) {
        return answer.to_string();
    }
    let mut out = format!("{}\n\nSources:", answer);
    let mut seen = BTreeSet::new();
    for source in sources {
        if seen.insert(source.path.as_str()) {
            out.push_str(&format!("\n- {}", source.path));
        }
    }
    out
}

fn code_snippets(answer: &str) -> Vec<String> {
    FENCED_CODE
        .captures_iter(answer)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

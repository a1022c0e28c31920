use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

// ── Oracle contract ───────────────────────────────────────────────────────────

/// What the caller wants the model to do with the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleTask {
    /// Place a piece of text on the six personality axes.
    Classify,
    /// Turn a consolidation batch into structured insights.
    Synthesize,
}

#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub task: OracleTask,
    pub prompt: String,
    pub temperature: f32,
}

impl OracleRequest {
    pub fn classify(prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            task: OracleTask::Classify,
            prompt: prompt.into(),
            temperature,
        }
    }

    pub fn synthesize(prompt: impl Into<String>, temperature: f32) -> Self {
        Self {
            task: OracleTask::Synthesize,
            prompt: prompt.into(),
            temperature,
        }
    }
}

/// A black-box reasoning capability: text in, raw text out.
///
/// Implementations may fail or take arbitrarily long; callers own timeouts
/// and validation of the returned text.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn complete(&self, request: &OracleRequest) -> Result<String>;
}

// ── Providers ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    LmStudio,
    Ollama,
    OpenRouter,
}

impl Provider {
    /// Parse a provider label from config (case-insensitive).  Unknown labels
    /// fall back to LM Studio.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "ollama" => Self::Ollama,
            "openrouter" => Self::OpenRouter,
            _ => Self::LmStudio,
        }
    }
}

/// Model used when LM Studio reports no loaded instance (JIT loading).
const LMSTUDIO_FALLBACK_MODEL: &str = "qwen/qwen3-30b-a3b-2507";

#[derive(Debug, Clone)]
pub struct LmStudioClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

impl LmStudioClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_token: api_token.filter(|t| !t.trim().is_empty()),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Return the key of the first model with a loaded instance, or the JIT
    /// fallback model when none is loaded or the server cannot be queried.
    pub async fn loaded_model(&self) -> String {
        let request = self
            .authorize(self.client.get(self.endpoint("/api/v1/models")))
            .timeout(Duration::from_secs(5));
        let body: Option<serde_json::Value> = match request.send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            _ => None,
        };

        body.as_ref()
            .and_then(|body| body.get("models"))
            .and_then(|models| models.as_array())
            .and_then(|models| {
                models.iter().find_map(|model| {
                    let instances = model.get("loaded_instances")?.as_array()?;
                    let first = instances.first()?;
                    model
                        .get("key")
                        .or_else(|| first.get("id"))
                        .and_then(|key| key.as_str())
                        .map(ToString::to_string)
                })
            })
            .unwrap_or_else(|| LMSTUDIO_FALLBACK_MODEL.to_string())
    }

    async fn chat_model(&self, model: &str, prompt: &str, temperature: f32) -> Result<String> {
        let payload = json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature,
            "stream": false
        });

        let response = self
            .authorize(self.client.post(self.endpoint("/v1/chat/completions")))
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("LM Studio error ({status}): {body}");
        }

        chat_completion_content(&body)
            .ok_or_else(|| anyhow::anyhow!("LM Studio response missing message content: {body}"))
    }
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn chat_model(&self, model: &str, prompt: &str, temperature: f32) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));

        let payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": temperature }
        });

        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("Ollama error ({status}): {body}");
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) => Ok(content.to_string()),
            None => bail!("Ollama response missing text: {body}"),
        }
    }
}

impl OpenRouterClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    async fn chat_model(&self, model: &str, prompt: &str, temperature: f32) -> Result<String> {
        let api_key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("OPENROUTER_API_KEY is not set");
        }

        let payload = json!({
            "model": model,
            "messages": [
                {"role": "user", "content": prompt}
            ],
            "temperature": temperature
        });

        let response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(api_key)
            .header("X-Title", "Awareness")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            bail!("OpenRouter error ({status}): {body}");
        }

        chat_completion_content(&body)
            .ok_or_else(|| anyhow::anyhow!("OpenRouter response missing message content: {body}"))
    }
}

impl Default for OpenRouterClient {
    fn default() -> Self {
        Self::new()
    }
}

fn chat_completion_content(body: &serde_json::Value) -> Option<String> {
    body.get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .map(ToString::to_string)
}

/// Routes oracle requests to the configured provider.
#[derive(Debug, Clone)]
pub struct LlmRouter {
    provider: Provider,
    /// Empty means "ask LM Studio which model is loaded".
    model: String,
    openrouter_model: String,
    lmstudio: LmStudioClient,
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
}

impl LlmRouter {
    pub fn new(
        provider: Provider,
        model: impl Into<String>,
        openrouter_model: impl Into<String>,
        lmstudio: LmStudioClient,
        ollama: OllamaClient,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            openrouter_model: openrouter_model.into(),
            lmstudio,
            ollama,
            openrouter: OpenRouterClient::new(),
        }
    }
}

#[async_trait]
impl ReasoningOracle for LlmRouter {
    async fn complete(&self, request: &OracleRequest) -> Result<String> {
        info!(
            provider = ?self.provider,
            task = ?request.task,
            prompt_len = request.prompt.len(),
            "oracle request"
        );
        let reply = match self.provider {
            Provider::LmStudio => {
                let model = if self.model.trim().is_empty() {
                    self.lmstudio.loaded_model().await
                } else {
                    self.model.clone()
                };
                self.lmstudio
                    .chat_model(&model, &request.prompt, request.temperature)
                    .await?
            }
            Provider::Ollama => {
                self.ollama
                    .chat_model(&self.model, &request.prompt, request.temperature)
                    .await?
            }
            Provider::OpenRouter => {
                self.openrouter
                    .chat_model(&self.openrouter_model, &request.prompt, request.temperature)
                    .await?
            }
        };
        debug!(reply_len = reply.len(), "oracle reply received");
        Ok(reply)
    }
}

// ── Embeddings ────────────────────────────────────────────────────────────────

/// Fetch an embedding from the Ollama `/api/embeddings` endpoint.
pub async fn ollama_embeddings(
    client: &reqwest::Client,
    base_url: &str,
    model: &str,
    text: &str,
) -> Result<Vec<f32>> {
    let url = format!("{}/api/embeddings", base_url.trim_end_matches('/'));
    let body = json!({ "model": model, "prompt": text });
    let response = client.post(&url).json(&body).send().await?;
    let status = response.status();
    let json: serde_json::Value = response.json().await?;
    if !status.is_success() {
        bail!("Ollama embeddings error ({status}): {json}");
    }
    let embedding = json["embedding"]
        .as_array()
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect::<Vec<f32>>()
        })
        .unwrap_or_default();
    if embedding.is_empty() {
        bail!("Ollama embeddings response carried no vector");
    }
    Ok(embedding)
}

// ── Structured output extraction ──────────────────────────────────────────────

/// Remove a `<think>…</think>` reasoning preamble that local reasoning models
/// prepend to their answer.  An unterminated `<think>` drops everything from
/// the tag onward.
pub fn strip_think_block(response: &str) -> &str {
    let Some(start) = response.find("<think>") else {
        return response;
    };
    match response.find("</think>") {
        Some(end) if end > start => &response[end + "</think>".len()..],
        _ => &response[..start],
    }
}

/// Extract the first valid JSON fenced code block from an LLM response.
///
/// Looks for ` ```json\n...\n` ``` ` delimiters, then falls back to the span
/// between the first `{` and the last `}`.  Any `<think>` block is stripped
/// first.  Returns `None` when nothing parses as `T`.
///
/// # Usage
///
/// ```rust
/// use awareness_llm::extract_json_output;
///
/// let raw = "Sure!\n```json\n{\"insight\":\"be brief\"}\n```";
/// let value: serde_json::Value = extract_json_output(raw).unwrap();
/// assert_eq!(value["insight"], "be brief");
/// ```
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    let response = strip_think_block(response);

    // Strategy 1: fenced ```json ... ``` blocks.
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    // Strategy 2: bare JSON object: first '{' to last '}'.
    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

// ── Tests ────────────────────────────────────────────────────────────────────

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::InferenceError;
use crate::types::StateSnapshot;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "dolphin-uncensored";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const ACTIONS_HELP: &str = r#"Available actions:
- {"action":"navigate","url":"https://..."}
- {"action":"click","selector":"[data-eid=\"[e0]\"]"}
- {"action":"fill","selector":"[data-eid=\"[e1]\"]","value":"search query"}
- {"action":"scrape","selector":"body","into":"main_content"}
- {"action":"wait","seconds":1}
- {"action":"screenshot","path":"screenshot.png"}
- {"action":"done"}

Use the [eN] element ids from the browser state where available, with selector format [data-eid="[eN]"]. Otherwise use CSS selectors.
Return ONLY JSON. No markdown, no explanation."#;

/// Sampling knobs passed along with a completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub system: Option<String>,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: None,
            system: None,
        }
    }
}

/// Black-box text completion.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError>;
}

/// A message in a chat-style conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Text produced by `/api/generate`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Generation {
    #[serde(default)]
    pub response: String,
    #[serde(default = "finished")]
    pub done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    message: ChatMessage,
    #[serde(default = "finished")]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct TagsReply {
    #[serde(default)]
    models: Vec<serde_json::Value>,
}

fn finished() -> bool {
    true
}

/// Client for a local Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, InferenceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            timeout,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn generate(
        &self,
        model: &str,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Generation, InferenceError> {
        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": sampling(options),
        });
        if let Some(ref system) = options.system {
            body["system"] = json!(system);
        }

        info!(model, prompt_chars = prompt.len(), "calling /api/generate");
        let reply: Generation = self.post_json("/api/generate", &body).await?;
        debug!(response_chars = reply.response.len(), "generation finished");
        Ok(reply)
    }

    pub async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<(ChatMessage, bool), InferenceError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "stream": false,
            "options": sampling(options),
        });

        info!(model, messages = messages.len(), "calling /api/chat");
        let reply: ChatReply = self.post_json("/api/chat", &body).await?;
        Ok((reply.message, reply.done))
    }

    pub async fn list_models(&self) -> Result<Vec<serde_json::Value>, InferenceError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let reply: TagsReply = self.read_reply(response).await?;
        Ok(reply.models)
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, InferenceError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        self.read_reply(response).await
    }

    async fn read_reply<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, InferenceError> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(rejection(status, &text));
        }
        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(self.timeout)
            } else {
                InferenceError::Decode(e.to_string())
            }
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> InferenceError {
        if err.is_timeout() {
            InferenceError::Timeout(self.timeout)
        } else {
            InferenceError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl InferenceService for OllamaClient {
    async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, InferenceError> {
        self.generate(&self.model, prompt, options)
            .await
            .map(|g| g.response)
    }
}

fn sampling(options: &CompletionOptions) -> serde_json::Value {
    let mut value = json!({ "temperature": options.temperature });
    if let Some(top_p) = options.top_p {
        value["top_p"] = json!(top_p);
    }
    value
}

fn rejection(status: StatusCode, body: &str) -> InferenceError {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"].as_str().map(String::from))
        .unwrap_or_else(|| body.trim().to_string());
    InferenceError::Rejected {
        status: status.as_u16(),
        message,
    }
}

/// Prompt asking for a complete multi-step plan.
pub fn plan_prompt(task: &str, snapshot: &StateSnapshot) -> String {
    format!(
        "You are a browser automation AI. Plan how to execute this task:\n\n{task}\n\n\
         Current browser state:\n{state}\n\n{ACTIONS_HELP}\n\n\
         Respond with a JSON plan:\n{{\"steps\": [<action>, <action>, ...]}}",
        state = snapshot.describe(),
    )
}

/// Prompt asking for the single next action toward `goal`.
pub fn decision_prompt(
    goal: &str,
    snapshot: &StateSnapshot,
    iteration: u32,
    max_iterations: u32,
) -> String {
    format!(
        "Goal: {goal}\n\nCurrent browser state:\n{state}\n\n\
         Iteration {iteration}/{max_iterations}\n\n\
         What should you do next to reach the goal?\n{ACTIONS_HELP}\n\n\
         Respond with ONE action as a JSON object, adding a \"reasoning\" field \
         that says why. Use {{\"action\":\"done\"}} once the goal is reached.",
        state = snapshot.describe(),
    )
}

//! Native-messaging host: a thin bridge between a browser extension and the
//! inference service.
//!
//! Requests carry a `type` discriminator (`generate` when absent). The host
//! adds no decision logic; it forwards to [`OllamaClient`] and reports the
//! result in the same frame protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::brain::{ChatMessage, CompletionOptions, OllamaClient};
use crate::error::InferenceError;
use crate::framing;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostRequest {
    Generate {
        #[serde(default)]
        prompt: String,
        model: Option<String>,
        system: Option<String>,
        context: Option<String>,
    },
    Chat {
        #[serde(default)]
        messages: Vec<ChatMessage>,
        model: Option<String>,
    },
    Ping,
    Models,
}

impl HostRequest {
    /// Decode a frame payload. Unknown types and broken JSON come back as a
    /// ready-made error response.
    pub fn decode(payload: &[u8]) -> Result<Self, HostResponse> {
        let mut value: Value = serde_json::from_slice(payload)
            .map_err(|e| HostResponse::failure(format!("Invalid message: {e}")))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| HostResponse::failure("Invalid message: expected a JSON object"))?;

        let kind = match obj.get("type") {
            None | Some(Value::Null) => "generate".to_string(),
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => return Err(HostResponse::failure(format!("Unknown message type: {other}"))),
        };
        if !matches!(kind.as_str(), "generate" | "chat" | "ping" | "models") {
            return Err(HostResponse::failure(format!("Unknown message type: {kind}")));
        }
        obj.insert("type".to_string(), Value::String(kind));

        serde_json::from_value(value)
            .map_err(|e| HostResponse::failure(format!("Invalid message: {e}")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pong: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HostResponse {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    fn from_inference_error(err: InferenceError) -> Self {
        warn!(error = %err, "inference call failed");
        match err {
            InferenceError::Unavailable(_) => {
                Self::failure("Cannot connect to Ollama. Is it running?")
            }
            InferenceError::Timeout(_) => Self::failure("Request timed out"),
            other => Self::failure(other.to_string()),
        }
    }
}

/// Prompt sent for a `generate` request carrying extra context.
pub fn contextual_prompt(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(context) if !context.is_empty() => format!("Context:\n{context}\n\nUser: {prompt}"),
        _ => prompt.to_string(),
    }
}

pub async fn handle_request(client: &OllamaClient, request: HostRequest) -> HostResponse {
    match request {
        HostRequest::Generate {
            prompt,
            model,
            system,
            context,
        } => {
            let model = model.unwrap_or_else(|| client.model().to_string());
            let options = CompletionOptions {
                temperature: 0.7,
                top_p: Some(0.9),
                system,
            };
            let prompt = contextual_prompt(&prompt, context.as_deref());
            match client.generate(&model, &prompt, &options).await {
                Ok(generation) => HostResponse {
                    success: true,
                    response: Some(generation.response),
                    model: Some(model),
                    done: Some(generation.done),
                    ..HostResponse::default()
                },
                Err(e) => HostResponse::from_inference_error(e),
            }
        }
        HostRequest::Chat { messages, model } => {
            let model = model.unwrap_or_else(|| client.model().to_string());
            match client
                .chat(&model, &messages, &CompletionOptions::default())
                .await
            {
                Ok((message, done)) => HostResponse {
                    success: true,
                    message: Some(message),
                    model: Some(model),
                    done: Some(done),
                    ..HostResponse::default()
                },
                Err(e) => HostResponse::from_inference_error(e),
            }
        }
        HostRequest::Ping => HostResponse {
            success: true,
            pong: Some(true),
            ..HostResponse::default()
        },
        HostRequest::Models => match client.list_models().await {
            Ok(models) => HostResponse {
                success: true,
                models: Some(models),
                ..HostResponse::default()
            },
            Err(e) => HostResponse::from_inference_error(e),
        },
    }
}

/// Serve requests until the reader reaches a clean end of stream.
pub async fn serve<R, W>(client: &OllamaClient, reader: &mut R, writer: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    info!("native messaging host started");
    while let Some(payload) = framing::read_frame(reader).await? {
        debug!(bytes = payload.len(), "received message");
        let response = match HostRequest::decode(&payload) {
            Ok(request) => handle_request(client, request).await,
            Err(response) => response,
        };
        framing::write_json(writer, &response).await?;
        debug!(success = response.success, "sent response");
    }
    info!("input closed, shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_type_means_generate() {
        let request = HostRequest::decode(br#"{"prompt": "hello"}"#).unwrap();
        assert_eq!(
            request,
            HostRequest::Generate {
                prompt: "hello".into(),
                model: None,
                system: None,
                context: None
            }
        );
    }

    #[test]
    fn unknown_type_is_reported_by_name() {
        let response = HostRequest::decode(br#"{"type": "summon"}"#).unwrap_err();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Unknown message type: summon"));
    }

    #[test]
    fn broken_json_gets_an_error_response() {
        let response = HostRequest::decode(b"{not json").unwrap_err();
        assert!(response.error.unwrap().starts_with("Invalid message"));
    }

    #[test]
    fn context_is_folded_into_the_prompt() {
        assert_eq!(
            contextual_prompt("Summarize", Some("Some page text")),
            "Context:\nSome page text\n\nUser: Summarize"
        );
        assert_eq!(contextual_prompt("Summarize", None), "Summarize");
    }

    #[test]
    fn ping_response_shape() {
        let value = serde_json::to_value(HostResponse {
            success: true,
            pong: Some(true),
            ..HostResponse::default()
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"success": true, "pong": true}));
    }
}

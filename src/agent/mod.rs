use async_trait::async_trait;
use futures_util::StreamExt;
use rig::agent::MultiTurnStreamItem;
use rig::client::Nothing;
use rig::completion::Prompt;
use rig::message::{Message as RigMessage, UserContent};
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use rig::streaming::{StreamedAssistantContent, StreamingPrompt};
use rig::OneOrMany;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::events::ResponseEvents;
use crate::models::{ChatFragment, CompletionRequest, Message, ModelInfo, Role};

#[cfg(test)]
pub mod testing;

const TITLE_INSTRUCTION: &str = "You are a helpful assistant that generates a short title for the \
                                 conversation you are given, and then concludes it with a single \
                                 emoji. Respond only with a JSON object of the form \
                                 {\"title\": \"...\", \"emoji\": \"...\"}.";
const MAX_TITLE_CHARS: usize = 100;

/// The language-model service the chat engine talks to.
#[async_trait]
pub trait ModelBackend: Send + Sync + 'static {
    /// Streams a completion for `request.transcript`. Every delta is published
    /// on `events` under `request.chat_id` and `request.stream_id`; returns once
    /// the stream ends or `request.cancel_token` is cancelled.
    async fn fetch_chat_data(
        &self,
        request: CompletionRequest,
        events: &ResponseEvents,
    ) -> Result<(), AppError>;

    async fn fetch_model_list(&self, api_url: &str) -> Result<Vec<ModelInfo>, AppError>;

    async fn generate_title(
        &self,
        api_url: &str,
        model_name: &str,
        transcript: &[Message],
    ) -> Result<String, AppError>;
}

/// Folds the transcript's system messages into one preamble.
fn system_preamble(transcript: &[Message]) -> Option<String> {
    let parts: Vec<&str> = transcript
        .iter()
        .filter(|m| m.role == Role::System && !m.content.trim().is_empty())
        .map(|m| m.content.as_str())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

fn to_rig_user(message: &Message) -> RigMessage {
    if message.images.is_empty() {
        return RigMessage::user(&message.content);
    }
    let mut contents = vec![UserContent::text(&message.content)];
    contents.extend(
        message
            .images
            .iter()
            .map(|image| UserContent::image_base64(image.clone(), None, None)),
    );
    match OneOrMany::many(contents) {
        Ok(content) => RigMessage::User { content },
        Err(_) => RigMessage::user(&message.content),
    }
}

/// Builds a rig history from the visible transcript. System messages go to the
/// preamble; tool output is not replayed.
fn to_rig_history(transcript: &[Message]) -> Vec<RigMessage> {
    transcript
        .iter()
        .filter_map(|m| match m.role {
            Role::User => Some(to_rig_user(m)),
            Role::Assistant => Some(RigMessage::assistant(&m.content)),
            Role::System | Role::Tool => None,
        })
        .collect()
}

fn render_transcript(transcript: &[Message]) -> String {
    transcript
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Deserialize)]
struct GeneratedTitle {
    #[serde(default)]
    title: String,
    #[serde(default)]
    emoji: String,
}

/// Turns the model's answer into `"<emoji> <title>"`.
///
/// A JSON answer must carry both fields. A plain-text answer is accepted as the
/// title on its own.
fn parse_title(raw: &str) -> Option<String> {
    let body = raw
        .trim()
        .trim_start_matches("```json")
        .trim_matches('`')
        .trim();

    if let Ok(generated) = serde_json::from_str::<GeneratedTitle>(body) {
        let title = generated.title.trim();
        let emoji = generated.emoji.trim();
        if title.is_empty() || emoji.is_empty() {
            return None;
        }
        return Some(format!("{emoji} {title}"));
    }
    if body.starts_with('{') {
        return None;
    }

    let line = body.lines().next()?.trim().trim_matches('"').trim_matches('\'').trim();
    if line.is_empty() {
        None
    } else {
        Some(line.chars().take(MAX_TITLE_CHARS).collect())
    }
}

/// Empty chat with `keep_alive: 0`, Ollama's way of unloading a model.
fn unload_request(model_name: &str) -> serde_json::Value {
    json!({ "model": model_name, "messages": [], "keep_alive": 0 })
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    details: TagDetails,
}

#[derive(Default, Deserialize)]
struct TagDetails {
    #[serde(default)]
    parameter_size: String,
}

/// [`ModelBackend`] backed by a local Ollama server through rig.
/// A fresh agent is built per request so the transcript is always replayed in full.
#[derive(Clone)]
pub struct OllamaBackend {
    http: reqwest::Client,
}

impl OllamaBackend {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// Asks Ollama to evict `model_name` right away so a paused generation
    /// stops using the GPU.
    async fn unload_model(&self, api_url: &str, model_name: &str) {
        let url = format!("{}/api/chat", api_url.trim_end_matches('/'));
        let body = unload_request(model_name);
        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(model = %model_name, "model unloaded after pause");
            }
            Ok(response) => warn!(model = %model_name, status = %response.status(), "model unload refused"),
            Err(e) => warn!(model = %model_name, "model unload failed: {e}"),
        }
    }

    fn client(api_url: &str) -> Result<ollama::Client, AppError> {
        ollama::Client::builder()
            .api_key(Nothing)
            .base_url(api_url)
            .build()
            .map_err(|e| {
                error!("Failed to build Ollama client for {api_url}: {e}");
                AppError::BackendUnavailable { host: api_url.to_string() }
            })
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    async fn fetch_chat_data(
        &self,
        request: CompletionRequest,
        events: &ResponseEvents,
    ) -> Result<(), AppError> {
        if request.cancel_token.is_cancelled() {
            debug!(chat_id = %request.chat_id, "request paused before it started");
            return Ok(());
        }

        let client = Self::client(&request.api_url)?;
        let mut history = to_rig_history(&request.transcript);
        let Some(prompt) = history.pop() else {
            return Err(AppError::EmptyField { field_name: "transcript".to_string() });
        };

        let builder = client
            .agent(&request.model_name)
            .additional_params(request.options.to_ollama_options());
        let agent = match system_preamble(&request.transcript) {
            Some(preamble) => builder.preamble(&preamble).build(),
            None => builder.build(),
        };

        debug!(chat_id = %request.chat_id, model = %request.model_name, turns = history.len() + 1, "streaming chat");
        let mut stream = agent.stream_prompt(prompt).with_history(history).await;

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = request.cancel_token.cancelled() => {
                    info!(chat_id = %request.chat_id, "stream paused by user");
                    drop(stream);
                    self.unload_model(&request.api_url, &request.model_name).await;
                    return Ok(());
                }
            };
            match item {
                Some(Ok(MultiTurnStreamItem::StreamAssistantItem(StreamedAssistantContent::Text(text)))) => {
                    events.emit(
                        &request.chat_id,
                        request.stream_id,
                        ChatFragment { role: Role::Assistant, content: text.text },
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Ollama streaming failed for chat {}: {e}", request.chat_id);
                    return Err(AppError::from_backend(
                        &request.api_url,
                        &request.model_name,
                        e.to_string(),
                    ));
                }
                None => return Ok(()),
            }
        }
    }

    async fn fetch_model_list(&self, api_url: &str) -> Result<Vec<ModelInfo>, AppError> {
        let url = format!("{}/api/tags", api_url.trim_end_matches('/'));
        let response = self.http.get(&url).send().await.map_err(|e| {
            error!("Failed to reach Ollama at {api_url}: {e}");
            AppError::BackendUnavailable { host: api_url.to_string() }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::InferenceError { message: format!("HTTP error! status: {status}") });
        }

        let tags: TagsResponse = response.json().await.map_err(|e| AppError::InferenceError {
            message: format!("Invalid response format: {e}"),
        })?;
        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo { name: m.name, parameter_size: m.details.parameter_size })
            .collect())
    }

    async fn generate_title(
        &self,
        api_url: &str,
        model_name: &str,
        transcript: &[Message],
    ) -> Result<String, AppError> {
        let agent = Self::client(api_url)?
            .agent(model_name)
            .preamble(TITLE_INSTRUCTION)
            .temperature(0.0)
            .build();

        let raw = agent
            .prompt(render_transcript(transcript).as_str())
            .await
            .map_err(|e| {
                error!("Title generation failed with {model_name}: {e}");
                AppError::from_backend(api_url, model_name, e.to_string())
            })?;

        parse_title(&raw).ok_or(AppError::TitleGenerationFailed)
    }
}

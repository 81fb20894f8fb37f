use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Title shown for chats nobody has named yet. A blank stored title means the same thing.
pub const UNTITLED_CHAT: &str = "Untitled chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the conversation tree, stored exactly as the record format lays it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub is_shown: bool,
    pub prev_id: Option<String>,
    pub next_ids: Vec<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model_name: Option<String>,
}

impl Message {
    /// A fresh, shown, childless node built from `draft`.
    pub fn from_draft(id: String, draft: MessageDraft) -> Self {
        Self {
            id,
            is_shown: true,
            prev_id: draft.prev_id,
            next_ids: Vec::new(),
            role: draft.role,
            content: draft.content,
            images: draft.images,
            llm_model_name: draft.llm_model_name,
        }
    }
}

/// Everything needed to create a message except its identifier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDraft {
    pub prev_id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub llm_model_name: Option<String>,
}

impl MessageDraft {
    pub fn user(prev_id: Option<String>, content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            prev_id,
            role: Role::User,
            content: content.into(),
            images,
            llm_model_name: None,
        }
    }

    pub fn assistant(
        prev_id: Option<String>,
        content: impl Into<String>,
        model_name: Option<String>,
    ) -> Self {
        Self {
            prev_id,
            role: Role::Assistant,
            content: content.into(),
            images: Vec::new(),
            llm_model_name: model_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

impl Chat {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: String::new(),
            updated_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn is_untitled(&self) -> bool {
        let title = self.title.trim();
        title.is_empty() || title == UNTITLED_CHAT
    }

    pub fn find(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }
}

impl Default for Chat {
    fn default() -> Self {
        Self::new()
    }
}

/// Listing projection of a [`Chat`] without message bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
}

impl ChatSummary {
    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            UNTITLED_CHAT
        } else {
            &self.title
        }
    }
}

impl From<&Chat> for ChatSummary {
    fn from(chat: &Chat) -> Self {
        Self {
            id: chat.id.clone(),
            title: chat.title.clone(),
            updated_at: chat.updated_at,
        }
    }
}

/// Partial update merged into a stored chat. `None` keeps the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatUpdate {
    pub title: Option<String>,
    pub messages: Option<Vec<Message>>,
}

impl ChatUpdate {
    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), messages: None }
    }

    pub fn messages(messages: Vec<Message>) -> Self {
        Self { title: None, messages: Some(messages) }
    }
}

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccentColor {
    Gray,
    Gold,
    Bronze,
    Brown,
    Yellow,
    Amber,
    Orange,
    Tomato,
    Red,
    Ruby,
    Crimson,
    Pink,
    Plum,
    Purple,
    Violet,
    Iris,
    #[default]
    Indigo,
    Blue,
    Cyan,
    Teal,
    Jade,
    Green,
    Grass,
    Lime,
    Mint,
    Sky,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub ollama_api_url: String,
    pub auto_generate_title: bool,
    #[serde(default)]
    pub selected_model: Option<String>,
    #[serde(default)]
    pub accent_color: AccentColor,
}

impl AppSettings {
    pub fn with_api_url(ollama_api_url: impl Into<String>) -> Self {
        Self {
            ollama_api_url: ollama_api_url.into(),
            auto_generate_title: true,
            selected_model: None,
            accent_color: AccentColor::default(),
        }
    }

    pub fn merge(mut self, update: AppSettingsUpdate) -> Self {
        if let Some(url) = update.ollama_api_url {
            self.ollama_api_url = url;
        }
        if let Some(auto) = update.auto_generate_title {
            self.auto_generate_title = auto;
        }
        if let Some(model) = update.selected_model {
            self.selected_model = model;
        }
        if let Some(color) = update.accent_color {
            self.accent_color = color;
        }
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettingsUpdate {
    pub ollama_api_url: Option<String>,
    pub auto_generate_title: Option<bool>,
    /// `Some(None)` clears the selection.
    #[serde(default, deserialize_with = "double_option")]
    pub selected_model: Option<Option<String>>,
    pub accent_color: Option<AccentColor>,
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer).map(Some)
}

/// Per-model generation options, stored in camelCase and sent to Ollama in snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOptions {
    pub mirostat: u8,
    pub mirostat_eta: f64,
    pub mirostat_tau: f64,
    pub num_ctx: u32,
    pub repeat_last_n: i32,
    pub repeat_penalty: f64,
    pub temperature: f64,
    pub seed: i64,
    pub num_predict: i32,
    pub top_k: u32,
    pub top_p: f64,
    pub min_p: f64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            mirostat: 0,
            mirostat_eta: 0.1,
            mirostat_tau: 5.0,
            num_ctx: 2048,
            repeat_last_n: 64,
            repeat_penalty: 1.1,
            temperature: 0.8,
            seed: 0,
            num_predict: -1,
            top_k: 40,
            top_p: 0.9,
            min_p: 0.0,
        }
    }
}

impl ModelOptions {
    pub fn to_ollama_options(&self) -> serde_json::Value {
        serde_json::json!({
            "mirostat": self.mirostat,
            "mirostat_eta": self.mirostat_eta,
            "mirostat_tau": self.mirostat_tau,
            "num_ctx": self.num_ctx,
            "repeat_last_n": self.repeat_last_n,
            "repeat_penalty": self.repeat_penalty,
            "temperature": self.temperature,
            "seed": self.seed,
            "num_predict": self.num_predict,
            "top_k": self.top_k,
            "top_p": self.top_p,
            "min_p": self.min_p,
        })
    }
}

pub type ModelSettings = BTreeMap<String, ModelOptions>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub name: String,
    pub parameter_size: String,
}

// ── Backend wire types ───────────────────────────────────────────────────────

/// Incremental piece of a streaming response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatFragment {
    pub role: Role,
    pub content: String,
}

/// One streaming completion. Fragments are emitted tagged with `chat_id` and
/// `stream_id`; cancelling `cancel_token` ends the stream early.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub chat_id: String,
    pub stream_id: u64,
    pub cancel_token: CancellationToken,
    pub api_url: String,
    pub model_name: String,
    pub transcript: Vec<Message>,
    pub options: ModelOptions,
}

// ── WebSocket wire types ─────────────────────────────────────────────────────

/// Command sent by the client over the chat WebSocket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsCommand {
    Send {
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    Regenerate {
        message_id: String,
    },
    Edit {
        message_id: String,
        content: String,
        #[serde(default)]
        images: Vec<String>,
    },
    Pause,
    SelectModel {
        #[serde(default)]
        model_name: Option<String>,
    },
}

/// Event pushed to the client over the chat WebSocket.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsEvent {
    Fragment { role: Role, content: String },
    Synced { chat: Chat, model_name: Option<String> },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_record_uses_camel_case_and_null_root_parent() {
        let msg = Message::from_draft("a".into(), MessageDraft::user(None, "hi", vec![]));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["isShown"], true);
        assert!(json["prevId"].is_null());
        assert_eq!(json["nextIds"], serde_json::json!([]));
        assert_eq!(json["role"], "user");
        assert!(json.get("llmModelName").is_none());
    }

    #[test]
    fn untitled_covers_blank_and_sentinel() {
        let mut chat = Chat::new();
        assert!(chat.is_untitled());
        chat.title = UNTITLED_CHAT.to_string();
        assert!(chat.is_untitled());
        chat.title = "🦀 Rust lifetimes".to_string();
        assert!(!chat.is_untitled());
    }

    #[test]
    fn settings_update_can_clear_selected_model() {
        let mut settings = AppSettings::with_api_url("http://localhost:11434");
        settings.selected_model = Some("llama3.2".into());

        let update: AppSettingsUpdate =
            serde_json::from_str(r#"{"selectedModel": null, "accentColor": "jade"}"#).unwrap();
        let merged = settings.clone().merge(update);
        assert_eq!(merged.selected_model, None);
        assert_eq!(merged.accent_color, AccentColor::Jade);

        let untouched = settings.clone().merge(AppSettingsUpdate::default());
        assert_eq!(untouched, settings);
    }

    #[test]
    fn ollama_options_are_snake_case() {
        let opts = ModelOptions::default().to_ollama_options();
        assert_eq!(opts["num_ctx"], 2048);
        assert_eq!(opts["top_k"], 40);
        assert!(opts.get("numCtx").is_none());
    }

    #[test]
    fn ws_commands_are_tagged() {
        let cmd: WsCommand = serde_json::from_str(r#"{"type":"regenerate","messageId":"m1"}"#).unwrap();
        assert_eq!(cmd, WsCommand::Regenerate { message_id: "m1".into() });
        let cmd: WsCommand = serde_json::from_str(r#"{"type":"send","content":"hi"}"#).unwrap();
        assert_eq!(cmd, WsCommand::Send { content: "hi".into(), images: vec![] });
        let cmd: WsCommand = serde_json::from_str(r#"{"type":"select_model","modelName":null}"#).unwrap();
        assert_eq!(cmd, WsCommand::SelectModel { model_name: None });
        assert_eq!(serde_json::from_str::<WsCommand>(r#"{"type":"pause"}"#).unwrap(), WsCommand::Pause);
    }

    #[test]
    fn ws_events_are_tagged() {
        let event = WsEvent::Fragment { role: Role::Assistant, content: "He".into() };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({"type": "fragment", "role": "assistant", "content": "He"})
        );
    }
}

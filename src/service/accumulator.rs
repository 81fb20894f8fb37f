use tracing::debug;

use crate::db::conversation_repository::ConversationRepository;
use crate::errors::AppError;
use crate::models::{Chat, ChatFragment, MessageDraft, Role};

/// Result of committing the in-progress response.
#[derive(Debug, Default)]
pub struct Commit {
    /// Id of the created message; `None` when nothing had arrived.
    pub message_id: Option<String>,
    /// The visible chat as re-read after the commit.
    pub chat: Option<Chat>,
}

/// In-progress assistant message for one session. Never persisted as is.
#[derive(Debug, Clone)]
pub struct StreamingAccumulator {
    role: Role,
    content: String,
    model_name: Option<String>,
}

impl StreamingAccumulator {
    pub fn new() -> Self {
        Self { role: Role::Assistant, content: String::new(), model_name: None }
    }

    /// Resets to an empty assistant message for `model_name`.
    pub fn start(&mut self, model_name: Option<String>) {
        self.role = Role::Assistant;
        self.content.clear();
        self.model_name = model_name;
    }

    pub fn push(&mut self, fragment: ChatFragment) {
        self.role = fragment.role;
        self.content.push_str(&fragment.content);
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Turns the buffered content into a tree node under `prev_id`, clears the
    /// buffer and re-reads the visible chat. Empty content creates nothing.
    pub async fn commit(
        &mut self,
        repo: &ConversationRepository,
        chat_id: &str,
        prev_id: &str,
    ) -> Result<Commit, AppError> {
        if self.content.is_empty() {
            debug!(chat_id, "nothing streamed; no commit");
            self.start(None);
            return Ok(Commit::default());
        }

        let draft = MessageDraft {
            prev_id: Some(prev_id.to_string()),
            role: self.role,
            content: std::mem::take(&mut self.content),
            images: Vec::new(),
            llm_model_name: self.model_name.take(),
        };
        self.start(None);

        let message_id = repo.create_message(chat_id, draft).await?;
        let chat = repo.load_visible_chat(chat_id, true).await?;
        debug!(chat_id, ?message_id, "response committed");
        Ok(Commit { message_id, chat })
    }
}

impl Default for StreamingAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

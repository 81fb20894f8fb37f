use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::db::store::KeyValueStore;
use crate::errors::AppError;
use crate::models::{Chat, ChatSummary, ChatUpdate, MessageDraft};
use crate::tree::{self, Alternatives, BranchDirection};

/// Whole-record persistence for chats plus a cached summary list.
///
/// Every message operation loads the full chat, mutates it in memory and
/// writes it back. There is no version check: two writers on the same chat
/// id will lose one update.
#[derive(Clone)]
pub struct ConversationRepository {
    store: Arc<dyn KeyValueStore>,
    summaries: Arc<RwLock<Option<Vec<ChatSummary>>>>,
}

impl ConversationRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store, summaries: Arc::new(RwLock::new(None)) }
    }

    async fn read_chat(&self, id: &str) -> Result<Option<Chat>, AppError> {
        self.store
            .get(id)
            .await?
            .map(|value| serde_json::from_value(value).map_err(AppError::from))
            .transpose()
    }

    async fn write_chat(&self, chat: &Chat) -> Result<(), AppError> {
        self.store.set(&chat.id, serde_json::to_value(chat)?).await
    }

    async fn refresh_summaries(&self) {
        if let Err(e) = self.list_summaries(true).await {
            error!("Failed to refresh chat summaries: {e}");
        }
    }

    /// Chats ordered by most recent update. Served from cache unless `force_refresh`.
    pub async fn list_summaries(&self, force_refresh: bool) -> Result<Vec<ChatSummary>, AppError> {
        if !force_refresh {
            if let Some(cached) = self.summaries.read().await.as_ref() {
                return Ok(cached.clone());
            }
        }

        let mut summaries = Vec::new();
        for key in self.store.keys().await? {
            match self.read_chat(&key).await {
                Ok(Some(chat)) => summaries.push(ChatSummary::from(&chat)),
                Ok(None) => {}
                Err(e) => warn!(chat_id = %key, "Skipping unreadable chat record: {e}"),
            }
        }
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        *self.summaries.write().await = Some(summaries.clone());
        Ok(summaries)
    }

    /// The full stored tree, unlinearized.
    pub async fn load_chat(&self, id: &str) -> Result<Option<Chat>, AppError> {
        self.read_chat(id).await
    }

    /// The chat with `messages` replaced by its visible path.
    pub async fn load_visible_chat(
        &self,
        id: &str,
        force_refresh: bool,
    ) -> Result<Option<Chat>, AppError> {
        let Some(mut chat) = self.read_chat(id).await? else {
            return Ok(None);
        };
        if force_refresh {
            self.refresh_summaries().await;
        }
        chat.messages = tree::linearize(&chat);
        Ok(Some(chat))
    }

    pub async fn create_chat(&self) -> Result<Chat, AppError> {
        let chat = Chat::new();
        self.write_chat(&chat).await?;
        debug!(chat_id = %chat.id, "chat created");
        self.refresh_summaries().await;
        Ok(chat)
    }

    pub async fn delete_chat(&self, id: &str) -> Result<(), AppError> {
        self.store.delete(id).await?;
        debug!(chat_id = id, "chat deleted");
        self.refresh_summaries().await;
        Ok(())
    }

    /// Merges `update` into the stored chat and bumps its timestamp.
    ///
    /// An empty title keeps the stored one. Returns `None` if the chat does not exist.
    pub async fn update_chat(&self, id: &str, update: ChatUpdate) -> Result<Option<Chat>, AppError> {
        let Some(mut chat) = self.read_chat(id).await? else {
            debug!(chat_id = id, "update skipped: chat not found");
            return Ok(None);
        };

        if let Some(title) = update.title.filter(|t| !t.is_empty()) {
            chat.title = title;
        }
        if let Some(messages) = update.messages {
            chat.messages = messages;
        }
        chat.updated_at = Utc::now().max(chat.updated_at);

        self.write_chat(&chat).await?;
        self.refresh_summaries().await;
        Ok(Some(chat))
    }

    async fn mutate_tree<T>(
        &self,
        chat_id: &str,
        mutate: impl FnOnce(&mut Chat) -> Option<T>,
    ) -> Result<Option<T>, AppError> {
        let Some(mut chat) = self.read_chat(chat_id).await? else {
            warn!(chat_id, "tree mutation skipped: chat not found");
            return Ok(None);
        };
        let Some(outcome) = mutate(&mut chat) else {
            return Ok(None);
        };
        self.update_chat(chat_id, ChatUpdate::messages(chat.messages)).await?;
        Ok(Some(outcome))
    }

    pub async fn create_message(
        &self,
        chat_id: &str,
        draft: MessageDraft,
    ) -> Result<Option<String>, AppError> {
        self.mutate_tree(chat_id, |chat| tree::create_message(chat, draft)).await
    }

    pub async fn switch_branch(&self, chat_id: &str, from_id: &str, to_id: &str) -> Result<bool, AppError> {
        let switched = self
            .mutate_tree(chat_id, |chat| tree::switch_branch(chat, from_id, to_id).then_some(()))
            .await?;
        Ok(switched.is_some())
    }

    pub async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<bool, AppError> {
        let deleted = self
            .mutate_tree(chat_id, |chat| tree::delete_message(chat, message_id).then_some(()))
            .await?;
        Ok(deleted.is_some())
    }

    pub async fn shift_branch(
        &self,
        chat_id: &str,
        message_id: &str,
        direction: BranchDirection,
    ) -> Result<Option<String>, AppError> {
        self.mutate_tree(chat_id, |chat| tree::shift_branch(chat, message_id, direction))
            .await
    }

    pub async fn alternatives(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Option<Alternatives>, AppError> {
        Ok(self
            .read_chat(chat_id)
            .await?
            .and_then(|chat| tree::alternatives(&chat, message_id)))
    }
}

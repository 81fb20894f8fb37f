pub mod accumulator;
pub mod chat_session;

use std::sync::Arc;

use crate::agent::ModelBackend;
use crate::db::conversation_repository::ConversationRepository;
use crate::db::settings_repository::SettingsRepository;
use crate::events::ResponseEvents;

/// Shared handles every chat session works against.
#[derive(Clone)]
pub struct SessionContext {
    pub conversations: ConversationRepository,
    pub settings: SettingsRepository,
    pub backend: Arc<dyn ModelBackend>,
    pub events: ResponseEvents,
}

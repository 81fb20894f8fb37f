use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::events::Subscription;
use crate::models::{Chat, ChatUpdate, CompletionRequest, Message, MessageDraft, Role};
use crate::service::accumulator::StreamingAccumulator;
use crate::service::SessionContext;
use crate::tree::BranchDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingResponse,
    Streaming,
    Committing,
    TitleGenerating,
}

/// Cloneable way to stop this session's current response while it is busy streaming.
///
/// Only the request in flight is affected; the next request gets a fresh token.
#[derive(Clone)]
pub struct PauseHandle {
    stop: Arc<watch::Sender<CancellationToken>>,
}

impl PauseHandle {
    pub fn pause(&self) {
        self.stop.borrow().cancel();
    }
}

/// State machine behind one open chat view.
///
/// Owns the view's fragment subscription; closing or dropping the session
/// releases it and invalidates any title generation still in flight.
pub struct ChatSession {
    ctx: SessionContext,
    chat: Chat,
    model_name: Option<String>,
    state: SessionState,
    accumulator: StreamingAccumulator,
    subscription: Subscription,
    view: watch::Sender<Option<String>>,
    stop: Arc<watch::Sender<CancellationToken>>,
    title_task: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Opens the visible chat `chat_id`. `None` if it does not exist.
    pub async fn open(ctx: SessionContext, chat_id: &str) -> Result<Option<Self>, AppError> {
        let Some(chat) = ctx.conversations.load_visible_chat(chat_id, false).await? else {
            return Ok(None);
        };
        let model_name = match ctx.settings.app_settings(false).await {
            Ok(settings) => settings.selected_model,
            Err(e) => {
                warn!(chat_id, "App settings unavailable; no model preselected: {e}");
                None
            }
        };
        let subscription = ctx.events.subscribe(chat_id);
        let (view, _) = watch::channel(Some(chat_id.to_string()));
        let (stop, _) = watch::channel(CancellationToken::new());

        info!(chat_id, ?model_name, "chat session opened");
        Ok(Some(Self {
            ctx,
            chat,
            model_name,
            state: SessionState::Idle,
            accumulator: StreamingAccumulator::new(),
            subscription,
            view,
            stop: Arc::new(stop),
            title_task: None,
        }))
    }

    pub fn chat_id(&self) -> &str {
        &self.chat.id
    }

    /// Last synced visible chat.
    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    pub fn state(&self) -> SessionState {
        match &self.title_task {
            Some(task) if self.state == SessionState::Idle && !task.is_finished() => {
                SessionState::TitleGenerating
            }
            _ => self.state,
        }
    }

    /// The response being streamed, if any.
    pub fn pending(&self) -> &StreamingAccumulator {
        &self.accumulator
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model_name.as_deref()
    }

    pub fn select_model(&mut self, model_name: Option<String>) {
        self.model_name = model_name.filter(|m| !m.trim().is_empty());
    }

    pub fn pause_handle(&self) -> PauseHandle {
        PauseHandle { stop: self.stop.clone() }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(chat_id = %self.chat.id, from = ?self.state, to = ?next, "session transition");
        self.state = next;
    }

    /// Re-reads the visible chat from the repository.
    pub async fn sync(&mut self) -> Result<&Chat, AppError> {
        match self.ctx.conversations.load_visible_chat(&self.chat.id, true).await? {
            Some(chat) => {
                self.chat = chat;
                Ok(&self.chat)
            }
            None => Err(AppError::ChatNotFound { id: self.chat.id.clone() }),
        }
    }

    fn begin(&mut self) -> Result<String, AppError> {
        if self.state != SessionState::Idle {
            warn!(chat_id = %self.chat.id, state = ?self.state, "previous request was interrupted; resetting");
            self.accumulator.start(None);
            self.transition(SessionState::Idle);
        }
        let model_name = self.model_name.clone().ok_or_else(|| {
            debug!(chat_id = %self.chat.id, "no model selected; nothing sent");
            AppError::NoModelSelected
        })?;
        self.stop.send_replace(CancellationToken::new());
        Ok(model_name)
    }

    /// Appends a user turn at the end of the visible path and streams a reply to it.
    pub async fn send(&mut self, content: &str, images: Vec<String>) -> Result<(), AppError> {
        if content.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        let model_name = self.begin()?;

        let prev_id = self.chat.messages.last().map(|m| m.id.clone());
        let draft = MessageDraft::user(prev_id, content, images);
        let Some(user_id) = self.ctx.conversations.create_message(&self.chat.id, draft).await? else {
            warn!(chat_id = %self.chat.id, "user message was not created");
            return Ok(());
        };
        self.sync().await?;

        let transcript = self.chat.messages.clone();
        self.respond(model_name, user_id, transcript, None).await
    }

    /// Streams an alternative to the assistant message `message_id` and shows it
    /// in its place. The original stays stored as a hidden sibling.
    pub async fn regenerate(&mut self, message_id: &str) -> Result<(), AppError> {
        let model_name = self.begin()?;

        let target = self
            .chat
            .messages
            .iter()
            .find(|m| m.id == message_id && m.role == Role::Assistant)
            .ok_or_else(|| AppError::MessageNotFound { id: message_id.to_string() })?;
        let Some(parent_id) = target.prev_id.clone() else {
            warn!(chat_id = %self.chat.id, message_id, "cannot regenerate a root message");
            return Ok(());
        };

        let transcript = transcript_through(&self.chat.messages, &parent_id);
        self.respond(model_name, parent_id, transcript, Some(message_id.to_string()))
            .await
    }

    /// Branches off an edited copy of user message `message_id` and streams a reply to it.
    pub async fn edit_and_resend(
        &mut self,
        message_id: &str,
        content: &str,
        images: Vec<String>,
    ) -> Result<(), AppError> {
        if content.trim().is_empty() {
            return Err(AppError::EmptyField { field_name: "message".to_string() });
        }
        let model_name = self.begin()?;

        let original = self
            .chat
            .messages
            .iter()
            .find(|m| m.id == message_id && m.role == Role::User)
            .ok_or_else(|| AppError::MessageNotFound { id: message_id.to_string() })?;
        let Some(parent_id) = original.prev_id.clone() else {
            warn!(chat_id = %self.chat.id, message_id, "cannot branch from the root message");
            return Ok(());
        };

        let draft = MessageDraft::user(Some(parent_id), content, images);
        let Some(edited_id) = self.ctx.conversations.create_message(&self.chat.id, draft).await? else {
            return Ok(());
        };
        self.ctx
            .conversations
            .switch_branch(&self.chat.id, message_id, &edited_id)
            .await?;
        self.sync().await?;

        let transcript = self.chat.messages.clone();
        self.respond(model_name, edited_id, transcript, None).await
    }

    async fn respond(
        &mut self,
        model_name: String,
        prev_id: String,
        transcript: Vec<Message>,
        replaces: Option<String>,
    ) -> Result<(), AppError> {
        self.transition(SessionState::AwaitingResponse);

        let app_settings = match self.ctx.settings.app_settings(false).await {
            Ok(settings) => settings,
            Err(e) => {
                error!(chat_id = %self.chat.id, "Cannot read app settings: {e}");
                self.transition(SessionState::Idle);
                return Ok(());
            }
        };
        let options = self
            .ctx
            .settings
            .model_options(&model_name)
            .await
            .unwrap_or_else(|e| {
                warn!("Model options unavailable for {model_name}, using defaults: {e}");
                Default::default()
            });

        self.accumulator.start(Some(model_name.clone()));
        let stream_id = self.ctx.events.next_stream_id();
        self.subscription.follow(stream_id);
        let request = CompletionRequest {
            chat_id: self.chat.id.clone(),
            stream_id,
            cancel_token: self.stop.borrow().clone(),
            api_url: app_settings.ollama_api_url.clone(),
            model_name: model_name.clone(),
            transcript,
            options,
        };

        let backend = self.ctx.backend.clone();
        let events = self.ctx.events.clone();
        let fetch = backend.fetch_chat_data(request, &events);
        tokio::pin!(fetch);

        self.transition(SessionState::Streaming);
        let outcome = loop {
            tokio::select! {
                result = &mut fetch => break result,
                fragment = self.subscription.recv() => match fragment {
                    Some(fragment) => self.accumulator.push(fragment),
                    None => break (&mut fetch).await,
                },
            }
        };
        while let Some(fragment) = self.subscription.try_recv() {
            self.accumulator.push(fragment);
        }
        if let Err(e) = &outcome {
            error!(chat_id = %self.chat.id, model = %model_name, "Model backend failed: {e}");
        }

        self.transition(SessionState::Committing);
        let chat_id = self.chat.id.clone();
        let commit = self
            .accumulator
            .commit(&self.ctx.conversations, &chat_id, &prev_id)
            .await;
        let committed = match commit {
            Ok(commit) => {
                if let (Some(old), Some(new)) = (replaces.as_deref(), commit.message_id.as_deref()) {
                    if let Err(e) = self.ctx.conversations.switch_branch(&chat_id, old, new).await {
                        error!(chat_id = %chat_id, "Failed to show regenerated message: {e}");
                    }
                }
                commit.message_id.is_some()
            }
            Err(e) => {
                error!(chat_id = %chat_id, "Failed to commit response: {e}");
                false
            }
        };
        if let Err(e) = self.sync().await {
            error!(chat_id = %chat_id, "Failed to re-sync chat after response: {e}");
        }
        self.transition(SessionState::Idle);

        if committed {
            self.maybe_generate_title(&app_settings.ollama_api_url, app_settings.auto_generate_title, model_name);
        }
        Ok(())
    }

    fn maybe_generate_title(&mut self, api_url: &str, enabled: bool, model_name: String) {
        let assistant_turns = self
            .chat
            .messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .count();
        let ends_with_reply = self
            .chat
            .messages
            .last()
            .is_some_and(|m| m.role == Role::Assistant);
        if !enabled || !self.chat.is_untitled() || assistant_turns != 1 || !ends_with_reply {
            return;
        }

        let backend = self.ctx.backend.clone();
        let repo = self.ctx.conversations.clone();
        let view = self.view.subscribe();
        let chat_id = self.chat.id.clone();
        let transcript = self.chat.messages.clone();
        let api_url = api_url.to_string();

        debug!(chat_id = %chat_id, "generating title");
        self.title_task = Some(tokio::spawn(async move {
            let title = match backend.generate_title(&api_url, &model_name, &transcript).await {
                Ok(title) => title,
                Err(e) => {
                    error!(chat_id = %chat_id, "Title generation failed: {e}");
                    return;
                }
            };
            let still_open = view.borrow().as_deref() == Some(chat_id.as_str());
            if !still_open {
                debug!(chat_id = %chat_id, "view closed; generated title discarded");
                return;
            }
            if let Err(e) = repo.update_chat(&chat_id, ChatUpdate::title(title)).await {
                error!(chat_id = %chat_id, "Failed to save generated title: {e}");
            }
        }));
    }

    /// Resolves once a pending title generation has finished; never resolves
    /// while none is pending. Cancel-safe, so it can sit in a `select!`.
    pub async fn title_settled(&mut self) {
        match self.title_task.as_mut() {
            Some(task) => {
                if let Err(e) = task.await {
                    error!(chat_id = %self.chat.id, "Title task panicked: {e}");
                }
            }
            None => std::future::pending::<()>().await,
        }
        self.title_task = None;
    }

    /// Waits for a pending title generation, then re-syncs.
    pub async fn wait_for_title(&mut self) -> Result<&Chat, AppError> {
        if self.title_task.is_some() {
            self.title_settled().await;
        }
        self.sync().await
    }

    pub async fn delete_message(&mut self, message_id: &str) -> Result<bool, AppError> {
        let deleted = self
            .ctx
            .conversations
            .delete_message(&self.chat.id, message_id)
            .await?;
        self.sync().await?;
        Ok(deleted)
    }

    pub async fn switch_branch(&mut self, from_id: &str, to_id: &str) -> Result<bool, AppError> {
        let switched = self
            .ctx
            .conversations
            .switch_branch(&self.chat.id, from_id, to_id)
            .await?;
        self.sync().await?;
        Ok(switched)
    }

    pub async fn shift_branch(
        &mut self,
        message_id: &str,
        direction: BranchDirection,
    ) -> Result<Option<String>, AppError> {
        let shown = self
            .ctx
            .conversations
            .shift_branch(&self.chat.id, message_id, direction)
            .await?;
        self.sync().await?;
        Ok(shown)
    }

    /// View teardown: stop listening for fragments and disown pending title writes.
    pub fn close(&mut self) {
        self.subscription.unsubscribe();
        self.stop.borrow().cancel();
        self.view.send_replace(None);
        info!(chat_id = %self.chat.id, "chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.stop.borrow().cancel();
        self.view.send_replace(None);
    }
}

/// Visible path up to and including `last_id`.
fn transcript_through(visible: &[Message], last_id: &str) -> Vec<Message> {
    match visible.iter().position(|m| m.id == last_id) {
        Some(end) => visible[..=end].to_vec(),
        None => visible.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::ScriptedBackend;
    use crate::db::conversation_repository::ConversationRepository;
    use crate::db::settings_repository::SettingsRepository;
    use crate::db::store::MemoryStore;
    use crate::events::ResponseEvents;
    use crate::models::{AppSettings, AppSettingsUpdate};

    async fn context(backend: ScriptedBackend, model: Option<&str>) -> (SessionContext, Arc<ScriptedBackend>) {
        let backend = Arc::new(backend);
        let settings = SettingsRepository::new(
            Arc::new(MemoryStore::new()),
            AppSettings::with_api_url("http://ollama:11434"),
        );
        settings
            .save_app_settings(AppSettingsUpdate {
                selected_model: Some(model.map(str::to_string)),
                ..Default::default()
            })
            .await
            .unwrap();
        let ctx = SessionContext {
            conversations: ConversationRepository::new(Arc::new(MemoryStore::new())),
            settings,
            backend: backend.clone(),
            events: ResponseEvents::new(),
        };
        (ctx, backend)
    }

    async fn open(ctx: &SessionContext) -> ChatSession {
        let chat = ctx.conversations.create_chat().await.unwrap();
        ChatSession::open(ctx.clone(), &chat.id).await.unwrap().unwrap()
    }

    fn contents(chat: &Chat) -> Vec<(Role, &str)> {
        chat.messages.iter().map(|m| (m.role, m.content.as_str())).collect()
    }

    #[tokio::test]
    async fn send_streams_and_commits_reply() {
        let (ctx, backend) = context(ScriptedBackend::default().with_fragments(&["Hel", "lo!"]), Some("llama3.2")).await;
        let mut session = open(&ctx).await;

        session.send("hi", vec![]).await.unwrap();

        assert!(matches!(session.state(), SessionState::Idle | SessionState::TitleGenerating));
        assert_eq!(contents(session.chat()), vec![(Role::User, "hi"), (Role::Assistant, "Hello!")]);
        let reply = session.chat().messages.last().unwrap();
        assert_eq!(reply.llm_model_name.as_deref(), Some("llama3.2"));
        assert!(session.pending().is_empty());

        let request = backend.last_request().unwrap();
        assert_eq!(request.model_name, "llama3.2");
        assert_eq!(request.api_url, "http://ollama:11434");
        assert_eq!(request.transcript.len(), 1);
    }

    #[tokio::test]
    async fn send_without_model_changes_nothing() {
        let (ctx, backend) = context(ScriptedBackend::default().with_fragments(&["x"]), None).await;
        let mut session = open(&ctx).await;

        let err = session.send("hi", vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::NoModelSelected));
        let stored = ctx.conversations.load_chat(session.chat_id()).await.unwrap().unwrap();
        assert!(stored.messages.is_empty());
        assert!(backend.last_request().is_none());
    }

    #[tokio::test]
    async fn blank_message_is_rejected() {
        let (ctx, _) = context(ScriptedBackend::default(), Some("m")).await;
        let mut session = open(&ctx).await;
        assert!(session.send("   ", vec![]).await.unwrap_err().is_validation());
        assert!(session.chat().messages.is_empty());
    }

    #[tokio::test]
    async fn backend_failure_keeps_only_user_turn() {
        let (ctx, _) = context(ScriptedBackend::default().failing(), Some("m")).await;
        let mut session = open(&ctx).await;

        session.send("hi", vec!["aGk=".into()]).await.unwrap();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(contents(session.chat()), vec![(Role::User, "hi")]);
        assert_eq!(session.chat().messages[0].images, vec!["aGk=".to_string()]);
    }

    #[tokio::test]
    async fn fragments_before_failure_are_committed() {
        let backend = ScriptedBackend::default()
            .with_fragments(&["partial"])
            .failing_after_fragments();
        let (ctx, _) = context(backend, Some("m")).await;
        let mut session = open(&ctx).await;

        session.send("hi", vec![]).await.unwrap();
        assert_eq!(contents(session.chat()), vec![(Role::User, "hi"), (Role::Assistant, "partial")]);
    }

    #[tokio::test]
    async fn pause_keeps_what_already_arrived() {
        let (backend, started, resume) = ScriptedBackend::default()
            .with_fragments(&["one ", "two ", "three"])
            .holding();
        let (ctx, _) = context(backend, Some("m")).await;
        let mut session = open(&ctx).await;
        let pause = session.pause_handle();

        let running = tokio::spawn(async move {
            session.send("count", vec![]).await.unwrap();
            session
        });
        started.notified().await;
        pause.pause();
        resume.notify_one();
        let session = running.await.unwrap();

        assert_eq!(contents(session.chat()), vec![(Role::User, "count"), (Role::Assistant, "one ")]);
    }

    #[tokio::test]
    async fn pausing_one_chat_leaves_another_streaming() {
        let (backend, started, resume) = ScriptedBackend::default()
            .with_fragments(&["one ", "two ", "three"])
            .holding();
        let (ctx, _) = context(backend, Some("m")).await;
        let idle_view = open(&ctx).await;
        let mut busy_view = open(&ctx).await;

        let running = tokio::spawn(async move {
            busy_view.send("count", vec![]).await.unwrap();
            busy_view
        });
        started.notified().await;
        idle_view.pause_handle().pause();
        resume.notify_one();
        let busy_view = running.await.unwrap();

        assert_eq!(busy_view.chat().messages[1].content, "one two three");
    }

    #[tokio::test]
    async fn pause_while_idle_does_not_cut_next_reply() {
        let (ctx, _) = context(ScriptedBackend::default().with_fragments(&["all ", "of it"]), Some("m")).await;
        let mut session = open(&ctx).await;

        session.pause_handle().pause();
        session.send("hi", vec![]).await.unwrap();

        assert_eq!(session.chat().messages[1].content, "all of it");
    }

    #[tokio::test]
    async fn another_views_reply_does_not_leak_into_this_one() {
        let (ctx, _) = context(ScriptedBackend::default().with_fragments(&["Hello"]), Some("m")).await;
        let mut first_view = open(&ctx).await;
        let mut second_view = ChatSession::open(ctx.clone(), first_view.chat_id()).await.unwrap().unwrap();

        first_view.send("hi", vec![]).await.unwrap();
        second_view.sync().await.unwrap();
        second_view.send("again", vec![]).await.unwrap();

        assert_eq!(
            contents(second_view.chat()),
            vec![
                (Role::User, "hi"),
                (Role::Assistant, "Hello"),
                (Role::User, "again"),
                (Role::Assistant, "Hello"),
            ]
        );
    }

    #[tokio::test]
    async fn title_settled_fires_once_the_title_lands() {
        let backend = ScriptedBackend::default().with_fragments(&["hello"]).with_title("📝 Notes");
        let (ctx, _) = context(backend, Some("m")).await;
        let mut session = open(&ctx).await;

        session.send("hi", vec![]).await.unwrap();
        session.title_settled().await;
        assert!(session.title_task.is_none());
        assert_eq!(session.sync().await.unwrap().title, "📝 Notes");

        let idle = tokio::time::timeout(std::time::Duration::from_millis(20), session.title_settled()).await;
        assert!(idle.is_err());
    }

    #[tokio::test]
    async fn regenerate_adds_hidden_alternative() {
        let (ctx, backend) = context(ScriptedBackend::default().with_fragments(&["again"]), Some("m")).await;
        let mut session = open(&ctx).await;
        session.send("hi", vec![]).await.unwrap();
        let first_reply = session.chat().messages[1].id.clone();

        session.regenerate(&first_reply).await.unwrap();

        let visible = session.chat();
        assert_eq!(visible.messages.len(), 2);
        assert_ne!(visible.messages[1].id, first_reply);
        assert_eq!(visible.messages[1].prev_id.as_deref(), Some(visible.messages[0].id.as_str()));

        let stored = ctx.conversations.load_chat(session.chat_id()).await.unwrap().unwrap();
        let hidden = stored.find(&first_reply).unwrap();
        assert!(!hidden.is_shown);
        assert_eq!(stored.messages[0].next_ids.len(), 2);

        // The regenerated request ends at the user turn.
        let request = backend.last_request().unwrap();
        assert_eq!(request.transcript.len(), 1);
        assert_eq!(request.transcript[0].role, Role::User);
    }

    #[tokio::test]
    async fn failed_regenerate_leaves_original_visible() {
        let (ctx, _) = context(ScriptedBackend::default().with_fragments(&["first"]), Some("m")).await;
        let mut session = open(&ctx).await;
        session.send("hi", vec![]).await.unwrap();
        let reply = session.chat().messages[1].id.clone();

        let ctx_failing = SessionContext { backend: Arc::new(ScriptedBackend::default().failing()), ..ctx.clone() };
        let mut session = ChatSession::open(ctx_failing, session.chat_id()).await.unwrap().unwrap();

        session.regenerate(&reply).await.unwrap();
        assert_eq!(session.chat().messages[1].id, reply);
    }

    #[tokio::test]
    async fn edit_branches_instead_of_rewriting() {
        let (ctx, _) = context(ScriptedBackend::default().with_fragments(&["ok"]), Some("m")).await;
        let mut session = open(&ctx).await;
        session.send("first", vec![]).await.unwrap();
        session.send("second", vec![]).await.unwrap();
        let second = session.chat().messages[2].id.clone();

        session.edit_and_resend(&second, "second, edited", vec![]).await.unwrap();

        assert_eq!(
            contents(session.chat()),
            vec![
                (Role::User, "first"),
                (Role::Assistant, "ok"),
                (Role::User, "second, edited"),
                (Role::Assistant, "ok"),
            ]
        );
        let stored = ctx.conversations.load_chat(session.chat_id()).await.unwrap().unwrap();
        assert_eq!(stored.find(&second).unwrap().content, "second");
        assert!(!stored.find(&second).unwrap().is_shown);
    }

    #[tokio::test]
    async fn first_reply_generates_title() {
        let backend = ScriptedBackend::default().with_fragments(&["hello"]).with_title("👋 Greetings");
        let (ctx, backend) = context(backend, Some("m")).await;
        let mut session = open(&ctx).await;

        session.send("hi", vec![]).await.unwrap();
        let chat = session.wait_for_title().await.unwrap();
        assert_eq!(chat.title, "👋 Greetings");

        session.send("more", vec![]).await.unwrap();
        session.wait_for_title().await.unwrap();
        assert_eq!(backend.title_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn title_is_not_written_after_view_closes() {
        let backend = ScriptedBackend::default().with_fragments(&["hello"]).with_title("late");
        let (ctx, _) = context(backend, Some("m")).await;
        let mut session = open(&ctx).await;
        let chat_id = session.chat_id().to_string();

        session.send("hi", vec![]).await.unwrap();
        session.close();
        if let Some(task) = session.title_task.take() {
            task.await.unwrap();
        }

        let stored = ctx.conversations.load_chat(&chat_id).await.unwrap().unwrap();
        assert!(stored.is_untitled());
    }

    #[tokio::test]
    async fn title_generation_can_be_disabled() {
        let backend = ScriptedBackend::default().with_fragments(&["hello"]).with_title("nope");
        let (ctx, backend) = context(backend, Some("m")).await;
        ctx.settings
            .save_app_settings(AppSettingsUpdate { auto_generate_title: Some(false), ..Default::default() })
            .await
            .unwrap();
        let mut session = open(&ctx).await;

        session.send("hi", vec![]).await.unwrap();
        assert!(session.wait_for_title().await.unwrap().is_untitled());
        assert_eq!(backend.title_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_chats_fragments_are_ignored() {
        let (ctx, _) = context(ScriptedBackend::default().with_fragments(&["mine"]), Some("m")).await;
        let mut session = open(&ctx).await;
        let stray = ctx.events.next_stream_id();
        ctx.events.emit("someone-else", stray, crate::models::ChatFragment { role: Role::Assistant, content: "noise".into() });

        session.send("hi", vec![]).await.unwrap();
        assert_eq!(session.chat().messages[1].content, "mine");
    }

    #[tokio::test]
    async fn branch_navigation_resyncs_view() {
        let (ctx, _) = context(ScriptedBackend::default().with_fragments(&["a"]), Some("m")).await;
        let mut session = open(&ctx).await;
        session.send("hi", vec![]).await.unwrap();
        let first = session.chat().messages[1].id.clone();
        session.regenerate(&first).await.unwrap();
        let second = session.chat().messages[1].id.clone();

        let shown = session.shift_branch(&second, BranchDirection::Previous).await.unwrap();
        assert_eq!(shown.as_deref(), Some(first.as_str()));
        assert_eq!(session.chat().messages[1].id, first);

        assert!(session.switch_branch(&first, &second).await.unwrap());
        assert_eq!(session.chat().messages[1].id, second);

        assert!(session.delete_message(&second).await.unwrap());
        assert_eq!(session.chat().messages.len(), 1);
    }

    #[tokio::test]
    async fn opening_missing_chat_yields_none() {
        let (ctx, _) = context(ScriptedBackend::default(), Some("m")).await;
        assert!(ChatSession::open(ctx, "missing").await.unwrap().is_none());
    }

    #[test]
    fn transcript_stops_at_requested_message() {
        let mk = |id: &str| Message::from_draft(id.into(), MessageDraft::user(None, id, vec![]));
        let visible = vec![mk("a"), mk("b"), mk("c")];
        let ids: Vec<String> = transcript_through(&visible, "b").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}

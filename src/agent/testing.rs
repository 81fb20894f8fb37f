use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::ModelBackend;
use crate::errors::AppError;
use crate::events::ResponseEvents;
use crate::models::{ChatFragment, CompletionRequest, Message, ModelInfo, Role};

/// Backend that replays canned fragments and records what it was asked.
#[derive(Default)]
pub struct ScriptedBackend {
    fragments: Vec<String>,
    models: Vec<ModelInfo>,
    title: Option<String>,
    failing: bool,
    fail_after_fragments: bool,
    /// Waited on after the first fragment so a test can act mid-stream.
    hold: Option<(Arc<Notify>, Arc<Notify>)>,
    pub requests: Mutex<Vec<CompletionRequest>>,
    pub title_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn with_fragments(mut self, fragments: &[&str]) -> Self {
        self.fragments = fragments.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Emits every fragment, then reports a failure.
    pub fn failing_after_fragments(mut self) -> Self {
        self.fail_after_fragments = true;
        self
    }

    /// Returns `(started, resume)`: `started` fires after the first fragment,
    /// the stream then waits for `resume`.
    pub fn holding(mut self) -> (Self, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let resume = Arc::new(Notify::new());
        self.hold = Some((started.clone(), resume.clone()));
        (self, started, resume)
    }

    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    async fn fetch_chat_data(
        &self,
        request: CompletionRequest,
        events: &ResponseEvents,
    ) -> Result<(), AppError> {
        let chat_id = request.chat_id.clone();
        let stream_id = request.stream_id;
        let cancel_token = request.cancel_token.clone();
        self.requests.lock().unwrap().push(request);

        if self.failing {
            return Err(AppError::BackendUnavailable { host: "scripted".into() });
        }

        for (i, fragment) in self.fragments.iter().enumerate() {
            if cancel_token.is_cancelled() {
                break;
            }
            events.emit(&chat_id, stream_id, ChatFragment { role: Role::Assistant, content: fragment.clone() });
            tokio::task::yield_now().await;

            if i == 0 {
                if let Some((started, resume)) = &self.hold {
                    started.notify_one();
                    resume.notified().await;
                }
            }
        }

        if self.fail_after_fragments {
            return Err(AppError::InferenceError { message: "stream reset".into() });
        }
        Ok(())
    }

    async fn fetch_model_list(&self, _api_url: &str) -> Result<Vec<ModelInfo>, AppError> {
        if self.failing {
            return Err(AppError::BackendUnavailable { host: "scripted".into() });
        }
        Ok(self.models.clone())
    }

    async fn generate_title(
        &self,
        _api_url: &str,
        _model_name: &str,
        _transcript: &[Message],
    ) -> Result<String, AppError> {
        self.title_calls.fetch_add(1, Ordering::SeqCst);
        self.title.clone().ok_or(AppError::TitleGenerationFailed)
    }
}

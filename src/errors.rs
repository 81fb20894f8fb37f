use thiserror::Error;

/// Top-level application error. Nothing here is fatal: callers log it and
/// carry on with "nothing changed".
#[derive(Debug, Error)]
pub enum AppError {
    // ── Store errors ─────────────────────────────────────────────────────────
    #[error("Store query failed: {message}")]
    StoreQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Malformed stored record: {0}")]
    Serialization(#[from] serde_json::Error),

    // ── Not found ────────────────────────────────────────────────────────────
    #[error("Chat '{id}' not found")]
    ChatNotFound { id: String },

    #[error("Message '{id}' not found")]
    MessageNotFound { id: String },

    // ── Backend errors ───────────────────────────────────────────────────────
    #[error("Ollama service unavailable at {host}")]
    BackendUnavailable { host: String },

    #[error("Model '{model_name}' not found in Ollama")]
    ModelNotFound { model_name: String },

    #[error("Inference error: {message}")]
    InferenceError { message: String },

    #[error("Failed to generate title")]
    TitleGenerationFailed,

    // ── Guard violations ─────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("No model selected")]
    NoModelSelected,
}

impl AppError {
    pub fn store_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::StoreQueryFailed { message: message.into(), source }
    }

    /// Classifies a transport/inference failure the way the Ollama client reports it.
    pub fn from_backend(host: &str, model_name: &str, message: String) -> Self {
        if message.contains("Connection refused") || message.contains("connect") {
            AppError::BackendUnavailable { host: host.to_string() }
        } else if message.contains("model") {
            AppError::ModelNotFound { model_name: model_name.to_string() }
        } else {
            AppError::InferenceError { message }
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::ChatNotFound { .. } | AppError::MessageNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::NoModelSelected)
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(
            self,
            AppError::BackendUnavailable { .. }
                | AppError::ModelNotFound { .. }
                | AppError::InferenceError { .. }
                | AppError::TitleGenerationFailed
        )
    }
}

use std::env;

use tracing::warn;

const DEFAULT_DATABASE_URL: &str = "sqlite://chat_tree.db?mode=rwc";
const DEFAULT_OLLAMA_API_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_PORT: u16 = 8080;

/// Process configuration. User-editable settings live in the store instead.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub database_url: String,
    /// Seeds `ollamaApiUrl` when no app settings are stored yet.
    pub ollama_api_base_url: String,
    pub port: u16,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = match lookup("PORT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!("PORT={raw} is not a valid port; using {DEFAULT_PORT}");
                DEFAULT_PORT
            }),
            None => DEFAULT_PORT,
        };
        Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            ollama_api_base_url: lookup("OLLAMA_API_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_OLLAMA_API_BASE_URL.to_string()),
            port,
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

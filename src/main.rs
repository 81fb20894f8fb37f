use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use chat_tree::agent::OllamaBackend;
use chat_tree::config::AppConfig;
use chat_tree::db::conversation_repository::ConversationRepository;
use chat_tree::db::settings_repository::SettingsRepository;
use chat_tree::db::store::SqliteStore;
use chat_tree::events::ResponseEvents;
use chat_tree::models::AppSettings;
use chat_tree::routes::api_routes::{
    alternatives_handler, create_chat_handler, delete_chat_handler, delete_message_handler,
    get_chat_handler, get_model_settings_handler, get_settings_handler, list_chats_handler,
    list_models_handler, put_model_settings_handler, rename_chat_handler, shift_branch_handler,
    switch_branch_handler, update_settings_handler,
};
use chat_tree::routes::ws_routes::ws_chat_handler;
use chat_tree::service::SessionContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_tree=debug,tower_http=debug".into()),
        )
        .init();

    // ── Database ──────────────────────────────────────────────────────────────
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .expect("Failed to open the SQLite database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run database migrations");

    info!("Database ready at {}", config.database_url);

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let ctx = SessionContext {
        conversations: ConversationRepository::new(Arc::new(SqliteStore::new(pool.clone(), "chats"))),
        settings: SettingsRepository::new(
            Arc::new(SqliteStore::new(pool, "settings")),
            AppSettings::with_api_url(&config.ollama_api_base_url),
        ),
        backend: Arc::new(OllamaBackend::new()),
        events: ResponseEvents::new(),
    };

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/api/chats", get(list_chats_handler).post(create_chat_handler))
        .route(
            "/api/chats/{id}",
            get(get_chat_handler).patch(rename_chat_handler).delete(delete_chat_handler),
        )
        .route("/api/chats/{id}/branch", post(switch_branch_handler))
        .route("/api/chats/{id}/messages/{message_id}", delete(delete_message_handler))
        .route(
            "/api/chats/{id}/messages/{message_id}/alternatives",
            get(alternatives_handler),
        )
        .route("/api/chats/{id}/messages/{message_id}/shift", post(shift_branch_handler))
        .route("/api/settings", get(get_settings_handler).patch(update_settings_handler))
        .route(
            "/api/settings/models",
            get(get_model_settings_handler).put(put_model_settings_handler),
        )
        .route("/api/models", get(list_models_handler))
        .route("/ws/chats/{id}", get(ws_chat_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(ctx);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}

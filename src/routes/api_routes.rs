use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::{AppSettingsUpdate, ChatSummary, ChatUpdate, ModelSettings};
use crate::service::SessionContext;
use crate::tree::BranchDirection;

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct RenameChat {
    pub title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchBranch {
    pub from_id: String,
    pub to_id: String,
}

#[derive(Deserialize)]
pub struct ShiftBranch {
    pub direction: BranchDirection,
}

// ── Chats ────────────────────────────────────────────────────────────────────

/// GET `/api/chats`: summaries, newest first. An unreadable store lists as empty.
pub async fn list_chats_handler(State(ctx): State<SessionContext>) -> Response {
    match ctx.conversations.list_summaries(true).await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => {
            error!("Failed to list chats: {e}");
            Json(Vec::<ChatSummary>::new()).into_response()
        }
    }
}

/// POST `/api/chats`: new empty chat
pub async fn create_chat_handler(State(ctx): State<SessionContext>) -> Response {
    match ctx.conversations.create_chat().await {
        Ok(chat) => {
            info!(chat_id = %chat.id, "chat created");
            (StatusCode::CREATED, Json(chat)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET `/api/chats/{id}`: the chat with only its visible path
pub async fn get_chat_handler(
    Path(id): Path<String>,
    State(ctx): State<SessionContext>,
) -> Response {
    visible_chat(&ctx, &id).await
}

/// PATCH `/api/chats/{id}`: rename; a blank title keeps the stored one
pub async fn rename_chat_handler(
    Path(id): Path<String>,
    State(ctx): State<SessionContext>,
    Json(body): Json<RenameChat>,
) -> Response {
    match ctx.conversations.update_chat(&id, ChatUpdate::title(body.title)).await {
        Ok(Some(_)) => visible_chat(&ctx, &id).await,
        Ok(None) => error_response(&AppError::ChatNotFound { id }),
        Err(e) => error_response(&e),
    }
}

/// DELETE `/api/chats/{id}`
pub async fn delete_chat_handler(
    Path(id): Path<String>,
    State(ctx): State<SessionContext>,
) -> Response {
    match ctx.conversations.delete_chat(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Tree operations ──────────────────────────────────────────────────────────

/// DELETE `/api/chats/{id}/messages/{message_id}`: removes one node, children stay stored
pub async fn delete_message_handler(
    Path((id, message_id)): Path<(String, String)>,
    State(ctx): State<SessionContext>,
) -> Response {
    match ctx.conversations.delete_message(&id, &message_id).await {
        Ok(true) => visible_chat(&ctx, &id).await,
        Ok(false) => not_found(&ctx, id, message_id).await,
        Err(e) => error_response(&e),
    }
}

/// GET `/api/chats/{id}/messages/{message_id}/alternatives`
pub async fn alternatives_handler(
    Path((id, message_id)): Path<(String, String)>,
    State(ctx): State<SessionContext>,
) -> Response {
    match ctx.conversations.alternatives(&id, &message_id).await {
        Ok(Some(alternatives)) => Json(alternatives).into_response(),
        Ok(None) => not_found(&ctx, id, message_id).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/api/chats/{id}/messages/{message_id}/shift`: show the previous/next sibling
pub async fn shift_branch_handler(
    Path((id, message_id)): Path<(String, String)>,
    State(ctx): State<SessionContext>,
    Json(body): Json<ShiftBranch>,
) -> Response {
    match ctx.conversations.shift_branch(&id, &message_id, body.direction).await {
        Ok(_) => visible_chat(&ctx, &id).await,
        Err(e) => error_response(&e),
    }
}

/// POST `/api/chats/{id}/branch`: `{ "fromId": "...", "toId": "..." }`
pub async fn switch_branch_handler(
    Path(id): Path<String>,
    State(ctx): State<SessionContext>,
    Json(body): Json<SwitchBranch>,
) -> Response {
    match ctx.conversations.switch_branch(&id, &body.from_id, &body.to_id).await {
        Ok(_) => visible_chat(&ctx, &id).await,
        Err(e) => error_response(&e),
    }
}

// ── Settings & models ────────────────────────────────────────────────────────

/// GET `/api/settings`
pub async fn get_settings_handler(State(ctx): State<SessionContext>) -> Response {
    match ctx.settings.app_settings(false).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PATCH `/api/settings`: only the fields present are changed
pub async fn update_settings_handler(
    State(ctx): State<SessionContext>,
    Json(update): Json<AppSettingsUpdate>,
) -> Response {
    if update.ollama_api_url.as_deref().is_some_and(|url| url.trim().is_empty()) {
        return error_response(&AppError::EmptyField { field_name: "ollamaApiUrl".to_string() });
    }
    match ctx.settings.save_app_settings(update).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/settings/models`: options per model the backend offers
pub async fn get_model_settings_handler(State(ctx): State<SessionContext>) -> Response {
    match ctx.settings.model_settings(true, ctx.backend.as_ref()).await {
        Ok(settings) => Json(settings).into_response(),
        Err(e) => error_response(&e),
    }
}

/// PUT `/api/settings/models`
pub async fn put_model_settings_handler(
    State(ctx): State<SessionContext>,
    Json(settings): Json<ModelSettings>,
) -> Response {
    match ctx.settings.save_model_settings(settings.clone()).await {
        Ok(()) => Json(settings).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/models`: installed models as reported by Ollama
pub async fn list_models_handler(State(ctx): State<SessionContext>) -> Response {
    let api_url = match ctx.settings.app_settings(false).await {
        Ok(settings) => settings.ollama_api_url,
        Err(e) => return error_response(&e),
    };
    match ctx.backend.fetch_model_list(&api_url).await {
        Ok(models) => Json(models).into_response(),
        Err(e) => error_response(&e),
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

async fn visible_chat(ctx: &SessionContext, id: &str) -> Response {
    match ctx.conversations.load_visible_chat(id, true).await {
        Ok(Some(chat)) => Json(chat).into_response(),
        Ok(None) => error_response(&AppError::ChatNotFound { id: id.to_string() }),
        Err(e) => error_response(&e),
    }
}

/// Tells a missing chat apart from a missing message.
async fn not_found(ctx: &SessionContext, id: String, message_id: String) -> Response {
    match ctx.conversations.load_chat(&id).await {
        Ok(Some(_)) => error_response(&AppError::MessageNotFound { id: message_id }),
        Ok(None) => error_response(&AppError::ChatNotFound { id }),
        Err(e) => error_response(&e),
    }
}

pub(crate) fn status_for(err: &AppError) -> StatusCode {
    if err.is_validation() {
        StatusCode::BAD_REQUEST
    } else if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if err.is_backend_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(err: &AppError) -> Response {
    let status = status_for(err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {err}");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::AppError;
use crate::models::{WsCommand, WsEvent};
use crate::service::chat_session::ChatSession;
use crate::service::SessionContext;

/// Commands the session loop runs in order. `pause` never gets here: the
/// reader serves it directly so it can interrupt a running reply.
#[derive(Debug)]
enum SessionCommand {
    Send { content: String, images: Vec<String> },
    Regenerate { message_id: String },
    Edit { message_id: String, content: String, images: Vec<String> },
    SelectModel { model_name: Option<String> },
}

/// GET `/ws/chats/{id}`: upgrades to a WebSocket bound to one chat view.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Path(chat_id): Path<String>,
    State(ctx): State<SessionContext>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx, chat_id))
}

/// Handles a single WebSocket connection, i.e. one open chat view.
///
/// Protocol:
/// - Client sends JSON commands tagged by `type`: `send`, `regenerate`, `edit`,
///   `pause`, `select_model`.
/// - Server pushes:
///   1. `{ "type": "fragment", "role": "...", "content": "..." }` while a reply streams
///   2. `{ "type": "synced", "chat": {...}, "modelName": "..." }` after every command
///      and again when a generated title lands
///   3. `{ "type": "error", "message": "..." }` when a command is rejected.
async fn handle_socket(socket: WebSocket, ctx: SessionContext, chat_id: String) {
    let (mut sink, mut stream) = socket.split();

    let mut session = match ChatSession::open(ctx.clone(), &chat_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            let message = AppError::ChatNotFound { id: chat_id }.to_string();
            send_event(&mut sink, &WsEvent::Error { message }).await;
            return;
        }
        Err(e) => {
            error!(chat_id = %chat_id, "Failed to open chat session: {e}");
            send_event(&mut sink, &WsEvent::Error { message: e.to_string() }).await;
            return;
        }
    };
    info!(chat_id = %chat_id, "WebSocket client connected");

    // ── Writer: everything the client sees goes through one channel ──────────
    let (tx, mut rx) = mpsc::channel::<WsEvent>(64);
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !send_event(&mut sink, &event).await {
                break;
            }
        }
    });

    // ── Fragments of the reply being streamed for this chat ──────────────────
    let mut fragments = ctx.events.subscribe(chat_id.clone());
    let fragment_tx = tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(fragment) = fragments.recv().await {
            let event = WsEvent::Fragment { role: fragment.role, content: fragment.content };
            if fragment_tx.send(event).await.is_err() {
                break;
            }
        }
    });

    // ── Reader: pause is served at once, the rest is queued for the session ──
    let (command_tx, mut command_rx) = mpsc::channel::<SessionCommand>(16);
    let pause = session.pause_handle();
    let reader_tx = tx.clone();
    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("WebSocket receive error: {e}");
                    break;
                }
            };
            let command = match serde_json::from_str::<WsCommand>(text.as_str()) {
                Ok(WsCommand::Pause) => {
                    pause.pause();
                    continue;
                }
                Ok(WsCommand::Send { content, images }) => SessionCommand::Send { content, images },
                Ok(WsCommand::Regenerate { message_id }) => SessionCommand::Regenerate { message_id },
                Ok(WsCommand::Edit { message_id, content, images }) => {
                    SessionCommand::Edit { message_id, content, images }
                }
                Ok(WsCommand::SelectModel { model_name }) => SessionCommand::SelectModel { model_name },
                Err(e) => {
                    let message = format!("Invalid command: {e}");
                    let _ = reader_tx.send(WsEvent::Error { message }).await;
                    continue;
                }
            };
            if command_tx.send(command).await.is_err() {
                break;
            }
        }
    });

    let _ = tx.send(synced(&session)).await;
    loop {
        let command = tokio::select! {
            command = command_rx.recv() => match command {
                Some(command) => command,
                None => break,
            },
            () = session.title_settled() => {
                match session.sync().await {
                    Ok(_) => {
                        let _ = tx.send(synced(&session)).await;
                    }
                    Err(e) => warn!(chat_id = %chat_id, "Re-sync after title generation failed: {e}"),
                }
                continue;
            }
        };
        debug!(chat_id = %chat_id, ?command, "command received");
        let result = match command {
            SessionCommand::Send { content, images } => session.send(&content, images).await,
            SessionCommand::Regenerate { message_id } => session.regenerate(&message_id).await,
            SessionCommand::Edit { message_id, content, images } => {
                session.edit_and_resend(&message_id, &content, images).await
            }
            SessionCommand::SelectModel { model_name } => {
                session.select_model(model_name);
                Ok(())
            }
        };
        if let Err(e) = result {
            let _ = tx.send(WsEvent::Error { message: e.to_string() }).await;
        }
        let _ = tx.send(synced(&session)).await;
    }

    session.close();
    reader.abort();
    forwarder.abort();
    drop(tx);
    let _ = writer.await;
    info!(chat_id = %chat_id, "WebSocket client disconnected");
}

fn synced(session: &ChatSession) -> WsEvent {
    WsEvent::Synced {
        chat: session.chat().clone(),
        model_name: session.model_name().map(str::to_string),
    }
}

/// Serializes a `WsEvent` and sends it; `false` once the client is gone.
async fn send_event(sink: &mut SplitSink<WebSocket, Message>, event: &WsEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => sink.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize WebSocket event: {e}");
            true
        }
    }
}

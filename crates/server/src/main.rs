use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    create_message, get_user, list_messages, list_users, mark_read, upsert_user, ApiContext,
    MessageLimits,
};
use shared::{
    domain::{MessageId, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateMessageRequest, ListMessagesQuery, MarkReadRequest, MarkReadResponse,
        MessageRecord, ServerEvent,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        limits: MessageLimits {
            max_message_chars: settings.max_message_chars,
        },
    };
    let (events, _) = broadcast::channel(settings.event_buffer);

    let state = AppState { api, events };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "message store listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", get(http_list_users))
        .route("/users/:user_id", get(http_get_user).put(http_upsert_user))
        .route("/messages", get(http_list_messages).post(http_create_message))
        .route("/messages/:message_id/read", post(http_mark_read))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    if err.code == ErrorCode::Internal {
        error!(error = %err.message, "store request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::new(ErrorCode::Internal, e.to_string())))?;
    Ok("ok")
}

async fn http_list_users(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<User>>> {
    let users = list_users(&state.api).await.map_err(reject)?;
    Ok(Json(users))
}

async fn http_get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<User>> {
    let user = get_user(&state.api, &UserId(user_id)).await.map_err(reject)?;
    Ok(Json(user))
}

async fn http_upsert_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(user): Json<User>,
) -> ApiResult<Json<User>> {
    if user.id.as_str() != user_id {
        return Err(reject(ApiError::validation(
            "user id in path and body must match",
        )));
    }
    let event = upsert_user(&state.api, user.clone()).await.map_err(reject)?;
    state.publish(event);
    Ok(Json(user))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListMessagesQuery>,
) -> ApiResult<Json<Vec<MessageRecord>>> {
    let messages = list_messages(&state.api, &q.participant, q.order)
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_create_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateMessageRequest>,
) -> ApiResult<Json<MessageRecord>> {
    let (record, event) = create_message(&state.api, req).await.map_err(reject)?;
    state.publish(event);
    Ok(Json(record))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<Json<MarkReadResponse>> {
    let message_id = MessageId(message_id);
    let (read_by, event) = mark_read(&state.api, message_id, &req.user_id)
        .await
        .map_err(reject)?;
    if let Some(event) = event {
        state.publish(event);
    }
    Ok(Json(MarkReadResponse {
        message_id,
        read_by,
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

/// Forwards every event visible to `user_id`. A subscriber that falls behind
/// the broadcast buffer is disconnected so that it resubscribes and reloads
/// a full snapshot instead of silently missing changes.
async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};
    use tokio::sync::broadcast::error::RecvError;

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();
    info!(user_id = %user_id, "change feed connected");

    let send_user = user_id.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(user_id = %send_user, skipped, "change feed lagged; closing connection");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
                Err(RecvError::Closed) => break,
            };
            if !event.is_visible_to(&send_user) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            incoming = receiver.next() => {
                if !matches!(incoming, Some(Ok(_))) {
                    break;
                }
            }
        }
    }
    send_task.abort();
    info!(user_id = %user_id, "change feed disconnected");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

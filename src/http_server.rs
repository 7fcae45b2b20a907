//! HTTP front of the shared store using Axum.

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::session::{SessionId, Validity};
use crate::state::AppState;
use crate::store::KvStore;

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    created: i64,
    expires: i64,
}

#[derive(Serialize)]
struct ValidityResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Raw key-value access
        .route("/kv/:key", get(get_value).put(put_value).delete(delete_value))
        .route("/kv/:key/watch", get(watch_value))
        // Session lifecycle
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(check_session))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the configured port.
pub async fn run_server(config: ServerConfig, state: AppState) -> crate::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> crate::Result<()> {
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health() -> &'static str {
    "OK"
}

async fn get_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<String, StatusCode> {
    match state.store.get(&key).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!(key = %key, error = %e, "Read failed");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn put_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let value = String::from_utf8(body.to_vec())
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;

    state
        .store
        .set(&key, value.clone())
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    debug!(key = %key, "Stored value");

    // No subscribers is fine.
    let _ = state.updates.send((key, value));
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_value(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .store
        .delete(&key)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn watch_value(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| stream_updates(socket, state, key))
}

/// Pushes the current value of `key`, then every later write to it.
async fn stream_updates(mut socket: WebSocket, state: AppState, key: String) {
    let mut updates = state.updates.subscribe();
    info!(key = %key, "Watcher connected");

    if let Ok(Some(current)) = state.store.get(&key).await {
        if socket.send(Message::Text(current)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok((k, value)) if k == key => {
                    if socket.send(Message::Text(value)).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(key = %key, skipped, "Watcher lagging, skipped updates");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!(key = %key, "Watcher disconnected");
}

async fn create_session(
    State(state): State<AppState>,
) -> Result<Json<CreateSessionResponse>, (StatusCode, String)> {
    let session = state
        .sessions
        .create()
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(CreateSessionResponse {
        session_id: session.id.to_string(),
        created: session.meta.created,
        expires: session.meta.expires,
    }))
}

async fn check_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ValidityResponse>, (StatusCode, String)> {
    let id = SessionId::parse(&id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let validity = state
        .sessions
        .check_validity(&id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(match validity {
        Validity::Valid(_) => ValidityResponse {
            valid: true,
            reason: None,
            message: None,
        },
        Validity::Invalid(reason) => ValidityResponse {
            valid: false,
            reason: Some(reason.as_str()),
            message: Some(reason.message()),
        },
    }))
}

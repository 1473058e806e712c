use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, Method},
    response::Response,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use tandem_shared::protocol::{ClientEvent, ServerEvent};
use tandem_shared::UserId;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{ConnectionId, Hub};

#[derive(Clone)]
pub struct AppState {
    pub hub: Hub,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            hub: Hub::new(config.max_peers),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    name: String,
    version: &'static str,
    connected_users: usize,
}

#[derive(Deserialize)]
struct WsParams {
    user_id: Option<String>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        connected_users: state.hub.connected_users().await,
    })
}

/// Upgrade to a signaling WebSocket. The user is named by the `user_id`
/// query parameter; the bearer token is accepted as is.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let user = params
        .user_id
        .filter(|u| !u.trim().is_empty())
        .map(UserId::new)
        .ok_or_else(|| ServerError::BadRequest("missing user_id".into()))?;

    let has_token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    if !has_token {
        debug!(user = %user.short(), "Signaling connection without bearer token");
    }

    // Reserve the slot before upgrading so a full server answers with an error status.
    let (connection, outbox) = state.hub.connect(&user).await?;

    let hub = state.hub.clone();
    let failed_user = user.clone();
    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!(user = %failed_user.short(), error = %e, "WebSocket upgrade failed");
            tokio::spawn(async move { hub.disconnect(&failed_user, connection).await });
        })
        .on_upgrade(move |socket| async move {
            run_connection(socket, state.hub, user, connection, outbox).await;
        }))
}

async fn run_connection(
    socket: WebSocket,
    hub: Hub,
    user: UserId,
    connection: ConnectionId,
    mut outbox: mpsc::Receiver<ServerEvent>,
) {
    let (mut write, mut read) = socket.split();

    let writer_user = user.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "Failed to encode server event");
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                debug!(user = %writer_user.short(), "Socket closed while writing");
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ClientEvent::from_json(&text) {
                        Ok(event) => {
                            debug!(user = %user.short(), event = event.name(), "Signaling event");
                            hub.dispatch(&user, event).await;
                        }
                        Err(e) => {
                            warn!(user = %user.short(), error = %e, "Ignoring malformed signaling event");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(user = %user.short(), error = %e, "Socket error");
                        break;
                    }
                }
            }
            _ = &mut writer => break,
        }
    }

    writer.abort();
    hub.disconnect(&user, connection).await;
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already bound listener.
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting rendezvous server");

    axum::serve(listener, app).await?;

    Ok(())
}

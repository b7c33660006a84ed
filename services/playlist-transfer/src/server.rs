//!
//! src/server.rs  Andrew Belles  Oct 8th, 2025
//!
//! Http and websocket surface. Users register their Spotify credential,
//! upload a csv to start a transfer, and watch its progress over a
//! websocket identified by their user id.
//!

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade}
    },
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post}
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream}
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bus::ProgressBus;
use crate::config::{ServerConfig, TransferConfig};
use crate::csv_input::parse_tracks;
use crate::fetch::SpotifyApi;
use crate::lookup::LookupEngine;
use crate::orchestrator::{JobContext, reject_input, start_job};
use crate::playlist::SpotifyPlaylists;
use crate::registry::{ClientMessage, ConnectionRegistry};
use crate::store::{CredentialStore, SpotifyUser};
use crate::types::UserId;
use crate::TransferError;

/// Time a fresh socket gets to identify itself
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub bus: ProgressBus,
    pub store: Arc<CredentialStore>,
    pub api: Arc<dyn SpotifyApi>,
    pub transfer: TransferConfig,
    pub market: String,
    pub connection_capacity: usize
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRequest {
    pub user_id: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvUpload {
    pub user_id: Option<String>,
    pub csv_file: Option<String>,
    pub upload_file_name: Option<String>
}

/// First message a websocket client sends
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
enum ClientRequest {
    User(String)
}

fn cors(allowed_origins: &[String]) -> Result<CorsLayer, TransferError> {
    let origins = allowed_origins.iter()
        .map(|o| HeaderValue::from_str(o)
            .map_err(|e| TransferError::Config(format!("ALLOWED_ORIGINS invalid {o}: {e}"))))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]))
}

pub fn router(state: AppState, cfg: &ServerConfig) -> Result<Router, TransferError> {
    Ok(Router::new()
        .route("/user", post(post_user))
        .route("/csv", post(post_csv))
        .route("/websocket", get(websocket_handler))
        .layer(cors(&cfg.allowed_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

pub async fn serve(state: AppState, cfg: &ServerConfig) -> Result<(), TransferError> {
    let app = router(state, cfg)?;
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, origins = ?cfg.allowed_origins, "server.listen");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("server.shutdown");
        })
        .await?;
    Ok(())
}

fn bad_request() -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "errorMessage": 1 }))).into_response()
}

fn playlist_name(upload_file_name: &str) -> String {
    let name = upload_file_name.trim();
    name.strip_suffix(".csv").unwrap_or(name).to_string()
}

async fn post_user(State(state): State<AppState>, Json(body): Json<UserRequest>) -> Response {
    let (Some(user_id), Some(refresh_token)) = (body.user_id, body.refresh_token) else {
        return bad_request();
    };
    if user_id.trim().is_empty() || refresh_token.trim().is_empty() {
        return bad_request();
    }

    let created = state.store.upsert_user(
        SpotifyUser::new(UserId(user_id), refresh_token, body.access_token)
    );
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    (status, Json(json!({ "created": created }))).into_response()
}

async fn post_csv(State(state): State<AppState>, Json(body): Json<CsvUpload>) -> Response {
    let (Some(user_id), Some(csv_file), Some(file_name)) =
        (body.user_id, body.csv_file, body.upload_file_name) else {
        return bad_request();
    };
    let user = UserId(user_id);
    let Some(refresh_token) = state.store.fetch_stored_credential(&user) else {
        debug!(user = %user, "csv.unknown_user");
        return bad_request();
    };

    if !state.registry.is_registered(&user) {
        warn!(user = %user, "csv.no_listener");
    }

    let tracks = match parse_tracks(&csv_file) {
        Ok(tracks) => tracks,
        Err(e) => {
            reject_input(&user, &state.bus, &e);
            return StatusCode::ACCEPTED.into_response();
        }
    };

    let engine = Arc::new(LookupEngine::new(
        state.api.clone(), user.clone(), refresh_token, state.market.clone(), &state.transfer
    ));
    let ctx = JobContext {
        playlists: Arc::new(SpotifyPlaylists::new(engine.clone())),
        bus: state.bus.clone()
    };

    // detached, the job outlives the request and any socket
    let _ = start_job(user, tracks, playlist_name(&file_name), engine, ctx, &state.transfer);
    StatusCode::ACCEPTED.into_response()
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Reads until the client names itself. `None` on close, timeout or junk.
async fn await_identity(receiver: &mut SplitStream<WebSocket>) -> Option<UserId> {
    let handshake = async {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    return match serde_json::from_str::<ClientRequest>(&text) {
                        Ok(ClientRequest::User(id)) => Some(UserId(id)),
                        Err(e) => {
                            warn!(error = %e, "ws.handshake.invalid");
                            None
                        }
                    };
                }
                Message::Close(_) => return None,
                _ => continue
            }
        }
        None
    };

    timeout(HANDSHAKE_TIMEOUT, handshake).await.unwrap_or_else(|_| {
        warn!("ws.handshake.timeout");
        None
    })
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ClientMessage
) -> Result<(), TransferError> {
    let text = serde_json::to_string(msg)?;
    sender.send(Message::Text(text)).await
        .map_err(|e| TransferError::Http(format!("websocket send: {e}")))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let Some(identity) = await_identity(&mut receiver).await else {
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    if !state.store.contains(&identity) {
        info!(user = %identity, "ws.unknown_user");
        let _ = send_message(&mut sender, &ClientMessage::User(false)).await;
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    // the answer is queued ahead of any progress, a client that read it is registered
    let (tx, mut rx) = mpsc::channel::<ClientMessage>(state.connection_capacity.max(1));
    let _ = tx.try_send(ClientMessage::User(true));
    let handle = state.registry.register(identity.clone(), tx);

    let writer_identity = identity.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = send_message(&mut sender, &msg).await {
                debug!(user = %writer_identity, error = %e, "ws.writer.failed");
                break;
            }
            if msg.is_terminal() {
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    });

    let reader = async {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    let writer_done = tokio::select! {
        _ = &mut writer => true,
        () = reader => false
    };
    if !writer_done {
        writer.abort();
    }

    state.registry.unregister(&handle);
    info!(user = %identity, conn_id = %handle.conn_id, "ws.closed");
}

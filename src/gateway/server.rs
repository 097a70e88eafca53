//! The axum HTTP/WebSocket listener (§4.J/§6). Grounded on the teacher's
//! `gateway::daemon::start_gateway` (port binding, PID file) and
//! `gateway::ws::handle_socket` (the per-connection `tokio::select!`
//! loop) — replacing the bus-subscription half of that loop (this
//! gateway has no broadcast bus to fan out) with a per-request-task
//! fan-in over an `mpsc` channel, which is how JSON-RPC pipelining
//! (§5, invariant 2) is implemented: each inbound message gets its own
//! spawned task, and responses are written back in whatever order they
//! complete.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::SinkExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use super::orchestrator::Orchestrator;
use super::session::Session;

#[derive(Clone)]
pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
    pub bearer_token: Arc<String>,
    /// `true` while some session holds the single-agent connection slot
    /// (§5, invariant 7). Shared across every `handle_socket` task.
    pub connection_slot: Arc<AtomicBool>,
}

pub async fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let session = Arc::new(Session::new((*state.bearer_token).clone(), state.connection_slot.clone()));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut auth_watchdog = tokio::time::interval(super::session::AUTH_DEADLINE);
    auth_watchdog.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = auth_watchdog.tick() => {
                if session.auth_expired() {
                    session.close();
                }
            }
            // Fan responses from concurrently-running request tasks back
            // onto the one socket they all share.
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if session.auth_expired() {
                            session.close();
                        }
                        if session.is_closed() {
                            let _ = socket.close().await;
                            break;
                        }
                        spawn_request(session.clone(), state.orchestrator.clone(), out_tx.clone(), text.to_string());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }

        if session.is_closed() {
            break;
        }
    }
}

fn spawn_request(session: Arc<Session>, orchestrator: Arc<Orchestrator>, out_tx: mpsc::UnboundedSender<String>, raw: String) {
    tokio::spawn(async move {
        let response = session.handle_raw(&orchestrator, &raw, &out_tx).await;
        if let Ok(text) = serde_json::to_string(&response) {
            let _ = out_tx.send(text);
        }
    });
}

pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

//! The HTTP admission surface (§6.3): extracts `playerName`, runs a
//! read-only quota precheck, and only then completes the websocket upgrade
//! reply — unlike the teacher's `websocket_handler`, which upgrades first
//! and validates inside the callback. The real, state-mutating registration
//! happens once the upgrade has actually produced a transport.

use crate::errors::AdmitError;
use crate::router::AdminRequest;
use crate::transport::{self, PendingTransport};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot};

#[derive(Deserialize)]
pub struct AdmissionQuery {
    #[serde(rename = "playerName")]
    player_name: Option<String>,
}

pub struct AdmissionState {
    pub to_admin: mpsc::Sender<AdminRequest>,
    next_addr_suffix: AtomicU64,
}

impl AdmissionState {
    pub fn new(to_admin: mpsc::Sender<AdminRequest>) -> Self {
        AdmissionState {
            to_admin,
            next_addr_suffix: AtomicU64::new(0),
        }
    }

    /// The production transport address: the per-process-unique suffix
    /// guards against two reconnects from the same remote address racing
    /// each other, which a bare socket address alone cannot rule out.
    fn allocate_addr(&self, remote: &str) -> String {
        let suffix = self.next_addr_suffix.fetch_add(1, Ordering::Relaxed);
        format!("{remote}#{suffix}")
    }
}

fn admit_error_response(err: &AdmitError) -> Response {
    let status = match err {
        AdmitError::EmptyPlayerName | AdmitError::Upgrade => StatusCode::BAD_REQUEST,
        AdmitError::Quota | AdmitError::PlayerQuota => StatusCode::SERVICE_UNAVAILABLE,
        AdmitError::DuplicateAddr(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<AdmissionQuery>,
    axum::extract::ConnectInfo(remote): axum::extract::ConnectInfo<std::net::SocketAddr>,
    State(state): State<Arc<AdmissionState>>,
) -> Response {
    let Some(player_name) = query.player_name.filter(|name| !name.is_empty()) else {
        return admit_error_response(&AdmitError::Upgrade);
    };

    let addr = state.allocate_addr(&remote.to_string());
    let (precheck_reply_tx, precheck_reply_rx) = oneshot::channel();
    let request = AdminRequest::CheckQuota {
        player_name: player_name.clone(),
        reply: precheck_reply_tx,
    };
    if state.to_admin.send(request).await.is_err() {
        return admit_error_response(&AdmitError::Upgrade);
    }
    match precheck_reply_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return admit_error_response(&err),
        Err(_) => return admit_error_response(&AdmitError::Upgrade),
    }

    // The precheck above is advisory only; it reserves nothing. The real,
    // state-mutating registration happens once, in `finish_admission`,
    // after the upgrade actually completes.
    ws.on_upgrade(move |socket| finish_admission(socket, player_name, addr, state))
}

async fn finish_admission(
    socket: axum::extract::ws::WebSocket,
    player_name: String,
    addr: String,
    state: Arc<AdmissionState>,
) {
    let (reader, writer) = transport::split(socket);
    let pending = PendingTransport {
        addr: addr.clone(),
        reader: Box::new(reader),
        writer: Box::new(writer),
    };
    let (reply_tx, reply_rx) = oneshot::channel();
    let request = AdminRequest::AddSocket {
        player_name,
        transport: pending,
        reply: reply_tx,
    };
    if state.to_admin.send(request).await.is_err() {
        return;
    }
    // The precheck was advisory; this is the authoritative admission check.
    // A failure here (lost a capacity race since the precheck) is not
    // retried — the client simply reconnects.
    let _ = reply_rx.await;
}

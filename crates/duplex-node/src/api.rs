//! Admin HTTP API for the Duplex node.
//!
//! Reads go straight to the engine; anything that changes channel state is
//! handed to the node event loop as a [`NodeCommand`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use duplex_core::{Addr, Amount, BlockNumber, ChannelBalance, ChannelId};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::commands::{CommandError, NodeCommand, PayResponse, Reply};
use crate::state::NodeState;

// --- Request / response types ---

#[derive(Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub address: Addr,
    pub block: BlockNumber,
    pub peers: Vec<Addr>,
    pub uptime_secs: u64,
}

#[derive(Deserialize)]
pub struct OpenChannelRequest {
    pub peer: Addr,
    #[serde(default)]
    pub token: Addr,
    pub cid: ChannelId,
    #[serde(default)]
    pub my_deposit: Amount,
    #[serde(default)]
    pub peer_deposit: Amount,
}

#[derive(Deserialize)]
pub struct DirectPayRequest {
    pub dest: Addr,
    #[serde(default)]
    pub token: Addr,
    pub amount: Amount,
}

#[derive(Deserialize)]
pub struct ConditionalPayRequest {
    pub dest: Addr,
    #[serde(default)]
    pub token: Addr,
    pub amount: Amount,
    /// Blocks until the pay's resolve deadline.
    pub timeout: u64,
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub endpoint: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn command_error(e: CommandError) -> ApiError {
    let status = match e {
        CommandError::NotFound(_) => StatusCode::NOT_FOUND,
        CommandError::Rejected(_) => StatusCode::BAD_REQUEST,
        CommandError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, e)
}

/// Send a command to the event loop and wait for its reply.
async fn dispatch<T>(
    state: &NodeState,
    build: impl FnOnce(Reply<T>) -> NodeCommand,
) -> Result<T, ApiError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state.command_tx.send(build(reply_tx)).await.map_err(|_| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "node event loop not running",
        )
    })?;
    match reply_rx.await {
        Ok(result) => result.map_err(command_error),
        Err(_) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "event loop dropped the reply channel",
        )),
    }
}

// --- Handlers ---

async fn handle_status(State(state): State<Arc<NodeState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        address: state.engine.address(),
        block: state.engine.current_block(),
        peers: state.transport.connected_peers(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn handle_balance(
    State(state): State<Arc<NodeState>>,
    Path(cid): Path<String>,
) -> Result<Json<ChannelBalance>, ApiError> {
    let cid = ChannelId::from_hex(&cid).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    let balance = state
        .engine
        .channel_balance(&cid)
        .await
        .map_err(|e| command_error(e.into()))?;
    Ok(Json(balance))
}

async fn handle_open_channel(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<OpenChannelRequest>,
) -> Result<StatusCode, ApiError> {
    dispatch(&state, |reply| NodeCommand::OpenChannel {
        peer: req.peer,
        token: req.token,
        cid: req.cid,
        my_deposit: req.my_deposit,
        peer_deposit: req.peer_deposit,
        reply,
    })
    .await?;
    Ok(StatusCode::CREATED)
}

async fn handle_direct_pay(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<DirectPayRequest>,
) -> Result<Json<PayResponse>, ApiError> {
    let resp = dispatch(&state, |reply| NodeCommand::SendDirectPay {
        dest: req.dest,
        token: req.token,
        amount: req.amount,
        reply,
    })
    .await?;
    Ok(Json(resp))
}

async fn handle_conditional_pay(
    State(state): State<Arc<NodeState>>,
    Json(req): Json<ConditionalPayRequest>,
) -> Result<Json<PayResponse>, ApiError> {
    let resp = dispatch(&state, |reply| NodeCommand::SendConditionalPay {
        dest: req.dest,
        token: req.token,
        amount: req.amount,
        timeout: req.timeout,
        reply,
    })
    .await?;
    Ok(Json(resp))
}

async fn handle_connect(
    State(state): State<Arc<NodeState>>,
    Path(peer): Path<String>,
    Json(req): Json<ConnectRequest>,
) -> Result<StatusCode, ApiError> {
    let peer = Addr::from_hex(&peer).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    dispatch(&state, |reply| NodeCommand::ConnectPeer {
        peer,
        endpoint: req.endpoint,
        reply,
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Server ---

pub fn build_router(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/channels", post(handle_open_channel))
        .route("/channels/{cid}/balance", get(handle_balance))
        .route("/pays/direct", post(handle_direct_pay))
        .route("/pays/conditional", post(handle_conditional_pay))
        .route("/peers/{addr}/connect", post(handle_connect))
        .with_state(state)
}

pub async fn start_api_server(listen_addr: SocketAddr, state: Arc<NodeState>) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    tracing::info!(%listen_addr, "admin API started");
    axum::serve(listener, app).await?;
    Ok(())
}

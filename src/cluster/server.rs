//! HTTP surface of one member: peer signals, in-flight lookups, health and
//! the manual batch trigger.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::flags::CoordinationFlags;
use super::notify::{SignalAck, SignalRequest, receive_signal};
use crate::models::MemberId;
use crate::orchestrator::BatchError;

/// Entry point the manual trigger calls into.
#[async_trait]
pub trait BatchTrigger: Send + Sync + 'static {
    /// Returns whether this call became the owner of the date's run.
    async fn trigger(
        &self,
        target_date: NaiveDate,
        batch_size: Option<usize>,
    ) -> Result<bool, BatchError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBatchRequest {
    pub target_date: NaiveDate,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunBatchResponse {
    pub owner: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightResponse {
    pub user_id: i64,
    pub in_flight: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub member_id: MemberId,
    pub batch_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponseBody {
    pub message: String,
}

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponseBody {
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Clone)]
struct ClusterState {
    member_id: MemberId,
    flags: Arc<CoordinationFlags>,
    trigger: Arc<dyn BatchTrigger>,
}

/// Cluster endpoint server handle.
pub struct ClusterServer {
    addr: SocketAddr,
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl ClusterServer {
    pub async fn start(
        bind_addr: &str,
        member_id: MemberId,
        flags: Arc<CoordinationFlags>,
        trigger: Arc<dyn BatchTrigger>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind cluster listener on {bind_addr}"))?;
        let addr = listener.local_addr()?;

        let state = ClusterState {
            member_id,
            flags,
            trigger,
        };
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(run_server(listener, state, shutdown_rx));

        info!(addr = %addr, member_id = %member_id, "cluster server started");
        Ok(Self { addr, shutdown_tx })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn run_server(
    listener: TcpListener,
    state: ClusterState,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let app = build_router(state);

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
    {
        error!(?err, "cluster server exited with error");
    }
}

fn build_router(state: ClusterState) -> Router {
    Router::new()
        .route("/cluster/signal", post(handle_signal))
        .route("/cluster/in-flight/{user_id}", get(in_flight))
        .route("/batch/run", post(run_batch))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn handle_signal(
    State(state): State<ClusterState>,
    Json(request): Json<SignalRequest>,
) -> Json<SignalAck> {
    Json(receive_signal(&state.flags, state.member_id, &request))
}

async fn in_flight(
    State(state): State<ClusterState>,
    Path(user_id): Path<i64>,
) -> Json<InFlightResponse> {
    Json(InFlightResponse {
        user_id,
        in_flight: state.flags.is_key_in_flight(user_id),
    })
}

async fn run_batch(
    State(state): State<ClusterState>,
    Json(request): Json<RunBatchRequest>,
) -> Result<Json<RunBatchResponse>, HttpError> {
    match state
        .trigger
        .trigger(request.target_date, request.batch_size)
        .await
    {
        Ok(owner) => Ok(Json(RunBatchResponse { owner })),
        Err(err) => {
            error!(error = %err, target_date = %request.target_date, "manual batch run failed");
            Err(HttpError::internal(err.to_string()))
        }
    }
}

async fn healthz(State(state): State<ClusterState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "tierbatch".to_string(),
        member_id: state.member_id,
        batch_running: state.flags.is_global_gate_raised(),
    })
}

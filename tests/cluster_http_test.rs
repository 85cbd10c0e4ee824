//! Cluster endpoint round trips over real HTTP.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::json;

use tierbatch::backends::{BackendError, MemoryBackend};
use tierbatch::cluster::{
    BatchTrigger, ClusterServer, ClusterSignals, CoordinationFlags, ErrorResponseBody,
    HealthResponse, HttpPeerNotifier, InFlightResponse, MembershipConfig, MembershipRegistry,
    NotifyError, RunBatchResponse,
};
use tierbatch::models::MemberId;
use tierbatch::orchestrator::BatchError;

/// Owns the first call, fails every later one.
#[derive(Default)]
struct OnceTrigger {
    calls: AtomicUsize,
}

#[async_trait]
impl BatchTrigger for OnceTrigger {
    async fn trigger(
        &self,
        target_date: NaiveDate,
        _batch_size: Option<usize>,
    ) -> Result<bool, BatchError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(true);
        }
        Err(BatchError::Claim {
            target_date,
            source: BackendError::Message("database unavailable".to_string()),
        })
    }
}

async fn start_member(flags: &Arc<CoordinationFlags>) -> (ClusterServer, MemberId) {
    let member_id = MemberId::new();
    let server = ClusterServer::start(
        "127.0.0.1:0",
        member_id,
        Arc::clone(flags),
        Arc::new(OnceTrigger::default()),
    )
    .await
    .expect("start server");
    (server, member_id)
}

#[tokio::test]
async fn signals_round_trip_between_members() {
    let backend = MemoryBackend::new();
    let peer_flags = Arc::new(CoordinationFlags::new());
    peer_flags.raise_global_gate();
    let (server, peer_id) = start_member(&peer_flags).await;

    MembershipRegistry::new(backend.clone(), peer_id, MembershipConfig::default())
        .register(1, server.addr().to_string())
        .await
        .expect("register peer");
    let local = MembershipRegistry::new(backend.clone(), MemberId::new(), MembershipConfig::default());
    local.register(0, "127.0.0.1:1").await.expect("register self");

    let local_flags = Arc::new(CoordinationFlags::new());
    let notifier = HttpPeerNotifier::new(Duration::from_secs(5)).expect("client");
    let signals = ClusterSignals::new(local, Arc::new(notifier), Arc::clone(&local_flags));

    assert_eq!(signals.broadcast_interrupt().await.expect("interrupt"), 1);
    assert!(local_flags.is_scale_out_raised());
    assert!(peer_flags.is_scale_out_raised());

    assert_eq!(signals.broadcast_resume().await.expect("resume"), 1);
    assert!(!local_flags.is_scale_out_raised());
    assert!(!peer_flags.is_scale_out_raised());

    server.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_fails_the_broadcast() {
    let backend = MemoryBackend::new();
    // Bind and drop a listener so the port is closed.
    let closed = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let address = closed.local_addr().expect("addr").to_string();
    drop(closed);

    MembershipRegistry::new(backend.clone(), MemberId::new(), MembershipConfig::default())
        .register(1, address)
        .await
        .expect("register peer");
    let local = MembershipRegistry::new(backend, MemberId::new(), MembershipConfig::default());
    local.register(0, "127.0.0.1:1").await.expect("register self");

    let flags = Arc::new(CoordinationFlags::new());
    let notifier = HttpPeerNotifier::new(Duration::from_secs(2)).expect("client");
    let signals = ClusterSignals::new(local, Arc::new(notifier), Arc::clone(&flags));

    let err = signals.broadcast_resume().await.expect_err("transport failure");
    assert!(matches!(err, NotifyError::Transport { .. }));
    assert!(!flags.is_scale_out_raised(), "local latch is reset before the broadcast");
}

#[tokio::test]
async fn manual_trigger_reports_owner_and_errors() {
    let flags = Arc::new(CoordinationFlags::new());
    let (server, member_id) = start_member(&flags).await;
    let client = reqwest::Client::new();
    let base = format!("http://{}", server.addr());

    let response = client
        .post(format!("{base}/batch/run"))
        .json(&json!({ "target_date": "2025-01-01", "batch_size": 500 }))
        .send()
        .await
        .expect("run");
    assert!(response.status().is_success());
    let body: RunBatchResponse = response.json().await.expect("body");
    assert!(body.owner);

    let response = client
        .post(format!("{base}/batch/run"))
        .json(&json!({ "target_date": "2025-01-01" }))
        .send()
        .await
        .expect("run");
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorResponseBody = response.json().await.expect("error body");
    assert!(body.message.contains("database unavailable"));

    let health: HealthResponse = client
        .get(format!("{base}/healthz"))
        .send()
        .await
        .expect("healthz")
        .json()
        .await
        .expect("health body");
    assert_eq!(health.status, "ok");
    assert_eq!(health.member_id, member_id);
    assert!(!health.batch_running);

    assert!(flags.mark_key_in_flight(42));
    let in_flight: InFlightResponse = client
        .get(format!("{base}/cluster/in-flight/42"))
        .send()
        .await
        .expect("in-flight")
        .json()
        .await
        .expect("in-flight body");
    assert!(in_flight.in_flight);

    server.shutdown().await;
}

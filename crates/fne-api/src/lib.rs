//! FNE API -- local HTTP diagnostics API.
//!
//! HTTP on 127.0.0.1:9480 by default. Bearer token auth from ~/.fne/api-token.
//! All routes are POST and read-only.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use fne_calltrack::{ActiveCall, CoreStats, FneCore, ParrotReport};
use fne_protocol::PeerId;
use fne_routing::SharedRules;
use serde::Serialize;
use std::sync::Arc;

/// Connected peer as seen by the transport.
#[derive(Debug, Clone, Serialize)]
pub struct PeerDetail {
    pub peer_id: PeerId,
    pub addr: String,
    pub last_seen_secs: u64,
    pub frames: u64,
}

/// Callback returning the transport's current peer list.
pub type PeerListFn = Box<dyn Fn() -> Vec<PeerDetail> + Send + Sync>;

/// Shared state for all API handlers.
pub struct AppState {
    pub core: Arc<FneCore>,
    pub rules: SharedRules,
    pub peer_id: PeerId,
    pub bearer_token: String,
    pub start_time: std::time::Instant,
    pub peer_list_fn: Option<PeerListFn>,
}

impl AppState {
    fn peers(&self) -> Vec<PeerDetail> {
        self.peer_list_fn.as_ref().map(|f| f()).unwrap_or_default()
    }
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/status", post(status))
        .route("/api/v1/calls", post(calls))
        .route("/api/v1/peers", post(peers))
        .route("/api/v1/rules", post(rules))
        .route("/api/v1/diagnostics", post(diagnostics))
        .with_state(state)
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, &'static str)> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let expected = format!("Bearer {}", state.bearer_token);
    if auth != expected {
        return Err((StatusCode::UNAUTHORIZED, "invalid bearer token"));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub peer_id: PeerId,
    pub uptime_secs: u64,
    pub peers: usize,
    pub active_calls: usize,
    pub pending_pdus: usize,
}

#[derive(Debug, Serialize)]
pub struct CallsResponse {
    pub total: usize,
    pub calls: Vec<ActiveCall>,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub total: usize,
    pub peers: Vec<PeerDetail>,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsResponse {
    pub peer_id: PeerId,
    pub uptime_secs: u64,
    pub counters: CoreStats,
    pub parrot: Vec<ParrotReport>,
    pub sessions: SessionCounts,
    pub rules: RuleCounts,
}

#[derive(Debug, Serialize)]
pub struct SessionCounts {
    pub dmr: usize,
    pub p25: usize,
}

#[derive(Debug, Serialize)]
pub struct RuleCounts {
    pub peers: usize,
    pub talkgroups: usize,
}

async fn status(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let core = &state.core;
    Json(StatusResponse {
        peer_id: state.peer_id,
        uptime_secs: state.start_time.elapsed().as_secs(),
        peers: state.peers().len(),
        active_calls: core.dmr().sessions().len() + core.p25().sessions().len(),
        pending_pdus: core.p25().reassembler().len(),
    })
    .into_response()
}

async fn calls(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let calls = state.core.active_calls();
    Json(CallsResponse {
        total: calls.len(),
        calls,
    })
    .into_response()
}

async fn peers(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let peers = state.peers();
    Json(PeersResponse {
        total: peers.len(),
        peers,
    })
    .into_response()
}

async fn rules(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let snapshot = state.rules.current();
    Json(&*snapshot).into_response()
}

async fn diagnostics(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(e) = check_auth(&state, &headers) {
        return e.into_response();
    }

    let core = &state.core;
    let rules = state.rules.current();
    Json(DiagnosticsResponse {
        peer_id: state.peer_id,
        uptime_secs: state.start_time.elapsed().as_secs(),
        counters: core.stats(),
        parrot: core.parrot_status(),
        sessions: SessionCounts {
            dmr: core.dmr().sessions().len(),
            p25: core.p25().sessions().len(),
        },
        rules: RuleCounts {
            peers: rules.peers.len(),
            talkgroups: rules.talkgroups.len(),
        },
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fne_calltrack::{DispatcherConfig, FrameSink, ManualClock, TransportError};
    use fne_protocol::dmr::{self, FLAG_VOICE_SYNC};
    use fne_protocol::StreamId;
    use fne_routing::{RoutingEngine, RuleSet};

    struct NullSink;

    impl FrameSink for NullSink {
        fn send_to_peer(
            &self,
            _peer_id: PeerId,
            _frame: Bytes,
            _seq: u16,
            _stream_id: StreamId,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn spawn_api() -> (String, Arc<AppState>) {
        let rules = SharedRules::new(
            RuleSet::from_toml_str("[[peers]]\nid = 1\n[[peers]]\nid = 2\n[[talkgroups]]\nid = 100\n")
                .unwrap(),
        );
        let core = Arc::new(FneCore::new(
            DispatcherConfig::default(),
            RoutingEngine::new(Arc::new(rules.clone())),
            Arc::new(NullSink),
            Arc::new(ManualClock::new()),
        ));
        let state = Arc::new(AppState {
            core,
            rules,
            peer_id: 9000,
            bearer_token: "test-token".into(),
            start_time: std::time::Instant::now(),
            peer_list_fn: Some(Box::new(|| {
                vec![PeerDetail {
                    peer_id: 1,
                    addr: "127.0.0.1:62031".into(),
                    last_seen_secs: 0,
                    frames: 3,
                }]
            })),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    async fn post(base: &str, path: &str, token: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(format!("{base}{path}"))
            .header("Authorization", format!("Bearer {token}"))
            .body("{}")
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rejects_bad_token() {
        let (base, _) = spawn_api().await;
        let resp = post(&base, "/api/v1/status", "wrong").await;
        assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_status_and_calls() {
        let (base, state) = spawn_api().await;
        let frame = dmr::build_frame(0, 7, 100, 1, 1, FLAG_VOICE_SYNC, 0xA, &[]).freeze();
        assert!(state.core.process_frame(1, 0xA, 0, frame, false));

        let status: serde_json::Value = post(&base, "/api/v1/status", "test-token")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(status["peer_id"], 9000);
        assert_eq!(status["active_calls"], 1);
        assert_eq!(status["peers"], 1);

        let calls: serde_json::Value = post(&base, "/api/v1/calls", "test-token")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(calls["total"], 1);
        assert_eq!(calls["calls"][0]["protocol"], "dmr");
        assert_eq!(calls["calls"][0]["dst_id"], 100);
    }

    #[tokio::test]
    async fn test_rules_and_diagnostics() {
        let (base, state) = spawn_api().await;
        // Unknown peer: counted as unauthorized
        let frame = dmr::build_frame(0, 7, 100, 77, 1, FLAG_VOICE_SYNC, 0xA, &[]).freeze();
        assert!(!state.core.process_frame(77, 0xA, 0, frame, false));

        let rules: serde_json::Value = post(&base, "/api/v1/rules", "test-token")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(rules["peers"].as_array().unwrap().len(), 2);
        assert_eq!(rules["talkgroups"][0]["id"], 100);

        let diag: serde_json::Value = post(&base, "/api/v1/diagnostics", "test-token")
            .await
            .json()
            .await
            .unwrap();
        assert_eq!(diag["counters"]["dmr"]["dropped_unauthorized"], 1);
        assert_eq!(diag["rules"]["talkgroups"], 1);
        assert_eq!(diag["parrot"][0]["protocol"], "dmr");
    }
}

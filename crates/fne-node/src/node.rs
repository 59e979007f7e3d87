//! Node assembly -- wires the engine to the UDP transport, background tasks
//! and the local API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fne_api::AppState;
use fne_calltrack::{Clock, FneCore, FrameSink, SystemClock};
use fne_routing::{RoutingEngine, SharedRules};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::FneConfig;
use crate::parrot_task::{self, PlaybackConfig};
use crate::peer_directory::PeerDirectory;
use crate::{expand_tilde, rules_task, sweep_task, transport_task};

/// A running node. Dropping it leaves the tasks running; call [`shutdown`](Self::shutdown).
pub struct RunningNode {
    pub udp_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub core: Arc<FneCore>,
    pub rules: SharedRules,
    pub peers: PeerDirectory,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningNode {
    /// Signal every task and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }

    /// Wait until one of the tasks exits on its own.
    pub async fn wait_any(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let handles = std::mem::take(&mut self.handles);
        let (_, _, rest) = futures::future::select_all(handles).await;
        self.handles = rest;
    }
}

/// Bind sockets and spawn the transport, sweep, parrot, rules and API tasks.
pub async fn start(
    cfg: &FneConfig,
    rules: SharedRules,
    bearer_token: String,
) -> anyhow::Result<RunningNode> {
    start_with_clock(cfg, rules, bearer_token, Arc::new(SystemClock)).await
}

pub async fn start_with_clock(
    cfg: &FneConfig,
    rules: SharedRules,
    bearer_token: String,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<RunningNode> {
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let (udp_addr, stream, datagram_sink) = transport_task::bind(&cfg.network.listen_addr).await?;
    let peers = PeerDirectory::with_address_pin(cfg.address_pin());
    let (out_tx, out_rx) = mpsc::channel(cfg.network.send_queue.max(1));
    let sink: Arc<dyn FrameSink> = Arc::new(transport_task::UdpSink::new(
        cfg.node.peer_id,
        peers.clone(),
        out_tx,
    ));

    let routing = RoutingEngine::new(Arc::new(rules.clone()));
    let core = Arc::new(FneCore::new(
        cfg.dispatcher_config(),
        routing,
        sink.clone(),
        clock,
    ));

    let mut handles = Vec::new();

    // Transport
    {
        let core = core.clone();
        let peers = peers.clone();
        let rules = rules.clone();
        let shutdown = shutdown_tx.subscribe();
        let trace_frames = cfg.node.debug;
        handles.push(tokio::spawn(async move {
            transport_task::run_recv_loop(stream, core, peers, rules, trace_frames, shutdown).await;
        }));
    }
    {
        let shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            transport_task::run_send_loop(datagram_sink, out_rx, shutdown).await;
        }));
    }

    // Sweep
    {
        let core = core.clone();
        let shutdown = shutdown_tx.subscribe();
        let interval = cfg.sweep_interval();
        handles.push(tokio::spawn(async move {
            sweep_task::run_sweep_loop(core, interval, shutdown).await;
        }));
    }

    // Parrot playback
    if cfg.parrot.enabled {
        let core = core.clone();
        let sink = sink.clone();
        let peers = peers.clone();
        let shutdown = shutdown_tx.subscribe();
        let playback = PlaybackConfig {
            delay: Duration::from_millis(cfg.parrot.playback_delay_ms),
            frame_interval: Duration::from_millis(cfg.parrot.frame_interval_ms.max(1)),
            originating_only: cfg.parrot.originating_only,
        };
        handles.push(tokio::spawn(async move {
            parrot_task::run_parrot_loop(core, sink, peers, playback, shutdown).await;
        }));
    }

    // Rules reload
    if let Some(path) = cfg.rules.path.as_deref() {
        if cfg.rules.reload_interval_secs > 0 {
            let rules = rules.clone();
            let path = expand_tilde(path);
            let interval = Duration::from_secs(cfg.rules.reload_interval_secs);
            let shutdown = shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                rules_task::run_rules_loop(rules, path, interval, shutdown).await;
            }));
        }
    }

    // API
    let listener = tokio::net::TcpListener::bind(&cfg.node.api_addr).await?;
    let api_addr = listener.local_addr()?;
    let state = {
        let peers = peers.clone();
        let clock = core.clock().clone();
        Arc::new(AppState {
            core: core.clone(),
            rules: rules.clone(),
            peer_id: cfg.node.peer_id,
            bearer_token,
            start_time: std::time::Instant::now(),
            peer_list_fn: Some(Box::new(move || peers.details(clock.now()))),
        })
    };
    {
        let router = fne_api::router(state);
        let mut shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("API server error: {e}");
            }
        }));
    }
    tracing::info!(%api_addr, "API listening");

    tracing::info!(
        peer_id = cfg.node.peer_id,
        %udp_addr,
        parrot = cfg.parrot.enabled,
        "fne node started"
    );

    Ok(RunningNode {
        udp_addr,
        api_addr,
        core,
        rules,
        peers,
        shutdown_tx,
        handles,
    })
}

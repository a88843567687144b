// ABOUTME: BOX-facing listener and component supervisor
// ABOUTME: Builds the shared services, spawns the background workers, shepherds shutdown

use crate::cloud::{CloudSession, ProbeConfig, probe};
use crate::config::Config;
use crate::connection::Connection;
use crate::control::ControlPipeline;
use crate::handler::Handler;
use crate::mode::ModeEngine;
use crate::publish::{ControlRequest, ControlStatus, ControlUpdate, FrameSink};
use crate::queue::{self, DurableQueue};
use crate::shutdown::Shutdown;
use crate::stats::Stats;
use crate::synth::{IdGen, Synthesiser};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

/// Run the proxy until `shutdown` completes.
///
/// Accepts BOX connections on `listener` and spawns one [`Handler`] per
/// connection. The durable queue, cloud session, mode engine and control
/// pipeline are shared services built here and handed to every handler.
///
/// `control_rx` is the ingress for setting requests; progress flows back
/// on `updates_tx` and as events on `sink`.
pub async fn run(
    listener: TcpListener,
    config: Config,
    sink: Arc<dyn FrameSink>,
    control_rx: mpsc::Receiver<ControlRequest>,
    updates_tx: mpsc::Sender<ControlUpdate>,
    shutdown: impl Future,
) -> crate::Result<()> {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let stats = Stats::new();
    let queue = Arc::new(DurableQueue::open(
        &config.queue_path,
        config.queue_max,
        config.queue_retry_ceiling,
        stats.clone(),
    )?);
    let cloud = CloudSession::spawn(
        config.cloud_addr(),
        config.cloud_connect_timeout,
        stats.clone(),
    );
    let engine = ModeEngine::new(
        config.clone(),
        Arc::clone(&queue),
        cloud.clone(),
        Arc::clone(&sink),
        stats.clone(),
    );
    let ids = IdGen::new();
    let synth = Synthesiser::new(Arc::clone(&ids));
    let control = ControlPipeline::new(
        ids,
        Arc::clone(&sink),
        updates_tx.clone(),
        stats.clone(),
        config.control_deadline,
        config.control_retry_max,
        config.control_backlog,
    );

    // Reachability probe feeding the mode engine.
    let (reachable_tx, reachable_rx) = watch::channel(true);
    tokio::spawn(probe::run(
        ProbeConfig {
            enabled: config.health_probe_enabled,
            interval: config.health_probe_interval,
            timeout: config.health_probe_timeout,
            up_threshold: config.health_probe_up_threshold,
            down_threshold: config.health_probe_down_threshold,
        },
        config.cloud_addr(),
        reachable_tx,
        Shutdown::new(notify_shutdown.subscribe()),
    ));
    tokio::spawn(run_reachability(
        Arc::clone(&engine),
        reachable_rx,
        Shutdown::new(notify_shutdown.subscribe()),
    ));

    // The single replay drainer for the queue.
    tokio::spawn(
        Arc::clone(&engine).run_drainer(Shutdown::new(notify_shutdown.subscribe())),
    );

    // Control pipeline: deadline sweeper plus request intake.
    tokio::spawn(
        Arc::clone(&control).run_timer(Shutdown::new(notify_shutdown.subscribe())),
    );
    tokio::spawn(run_control_intake(
        Arc::clone(&control),
        control_rx,
        updates_tx,
        Shutdown::new(notify_shutdown.subscribe()),
    ));

    // Periodic counters for the telemetry reporter / logs.
    tokio::spawn(run_stats_reporter(
        stats.clone(),
        Arc::clone(&queue),
        Shutdown::new(notify_shutdown.subscribe()),
    ));

    let mut server = Listener {
        listener,
        config,
        stats,
        queue: Arc::clone(&queue),
        cloud,
        engine,
        synth,
        control,
        sink,
        notify_shutdown,
        shutdown_complete_tx,
    };

    tokio::select! {
        res = server.run() => {
            if let Err(err) = res {
                error!(cause = %err, "listener failed");
            }
        }
        _ = shutdown => {
            info!("shutting down");
        }
    }

    let Listener { notify_shutdown, shutdown_complete_tx, config, queue, .. } = server;

    // Dropping the broadcast sender wakes every Shutdown listener; the
    // handlers finish their in-flight frame and drop their completion
    // handles.
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    let _ = time::timeout(config.shutdown_grace, shutdown_complete_rx.recv()).await;

    if let Err(e) = queue.flush() {
        warn!(error = %e, "queue flush on shutdown failed");
    }
    Ok(())
}

/// Listener state: accepts inbound BOX connections and hands each one to
/// its own handler task.
struct Listener {
    listener: TcpListener,
    config: Config,
    stats: Stats,
    queue: Arc<DurableQueue>,
    cloud: CloudSession,
    engine: Arc<ModeEngine>,
    synth: Synthesiser,
    control: Arc<ControlPipeline>,
    sink: Arc<dyn FrameSink>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
}

impl Listener {
    async fn run(&mut self) -> crate::Result<()> {
        info!("accepting BOX connections");
        loop {
            let socket = self.accept().await?;
            let peer = socket.peer_addr().map(|a| a.to_string()).unwrap_or_default();
            info!(peer = %peer, "BOX connected");

            // Latency windows are tight; do not let Nagle batch replies.
            if let Err(e) = socket.set_nodelay(true) {
                debug!(error = %e, "could not set TCP_NODELAY on BOX socket");
            }

            // The newest connection owns the cloud relay. One BOX per
            // proxy instance; a reconnect simply takes over.
            let (relay_tx, relay_rx) = mpsc::channel(64);
            self.cloud.set_relay(relay_tx).await;

            let mut handler = Handler {
                connection: Connection::new(socket, self.stats.clone()),
                engine: Arc::clone(&self.engine),
                queue: Arc::clone(&self.queue),
                cloud: self.cloud.clone(),
                synth: self.synth.clone(),
                control: Arc::clone(&self.control),
                sink: Arc::clone(&self.sink),
                stats: self.stats.clone(),
                shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                relay_rx,
                relay_closed: false,
            };
            let complete = self.shutdown_complete_tx.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.run().await {
                    warn!(cause = %err, "BOX connection error");
                }
                drop(complete);
            });
        }
    }

    /// Accept with exponential backoff on transient errors. Gives up only
    /// after the backoff passes one minute - an unrecoverable listen
    /// socket is the one failure that aborts the process.
    async fn accept(&mut self) -> crate::Result<TcpStream> {
        let mut backoff = 1;
        loop {
            match self.listener.accept().await {
                Ok((socket, _)) => return Ok(socket),
                Err(err) => {
                    if backoff > 64 {
                        return Err(err.into());
                    }
                    warn!(error = %err, backoff, "accept failed, backing off");
                    time::sleep(Duration::from_secs(backoff)).await;
                    backoff *= 2;
                }
            }
        }
    }
}

async fn run_reachability(
    engine: Arc<ModeEngine>,
    mut reachable_rx: watch::Receiver<bool>,
    mut shutdown: Shutdown,
) {
    loop {
        tokio::select! {
            res = reachable_rx.changed() => {
                if res.is_err() {
                    break;
                }
                let up = *reachable_rx.borrow_and_update();
                engine.on_reachability(up);
            }
            _ = shutdown.recv() => break,
        }
    }
}

async fn run_control_intake(
    control: Arc<ControlPipeline>,
    mut control_rx: mpsc::Receiver<ControlRequest>,
    updates_tx: mpsc::Sender<ControlUpdate>,
    mut shutdown: Shutdown,
) {
    loop {
        let request = tokio::select! {
            req = control_rx.recv() => req,
            _ = shutdown.recv() => break,
        };
        let Some(request) = request else { break };
        if let Err(e) = control.submit(request.clone()) {
            let _ = updates_tx.try_send(ControlUpdate {
                correlation_id: request.correlation_id,
                status: ControlStatus::Failed,
                reason: Some(e.to_string()),
            });
        }
    }
}

async fn run_stats_reporter(stats: Stats, queue: Arc<DurableQueue>, mut shutdown: Shutdown) {
    let mut ticker = time::interval(Duration::from_secs(60));
    // The immediate first tick would log all zeros.
    ticker.tick().await;
    while !shutdown.is_shutdown() {
        tokio::select! {
            _ = ticker.tick() => {
                let snap = stats.snapshot();
                info!(
                    from_box = snap.frames_from_box,
                    to_box = snap.frames_to_box,
                    to_cloud = snap.frames_to_cloud,
                    from_cloud = snap.frames_from_cloud,
                    parse_errors = snap.parse_errors,
                    fallbacks = snap.cloud_fallbacks,
                    queue_size = queue.size(),
                    queue_oldest_secs = queue
                        .oldest_age(queue::now_ms())
                        .map(|a| a.as_secs())
                        .unwrap_or(0),
                    "proxy counters"
                );
            }
            _ = shutdown.recv() => break,
        }
    }
}

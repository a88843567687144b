// ABOUTME: Mode engine - decides per frame between cloud forwarding and local answering
// ABOUTME: Owns the ONLINE/OFFLINE/HYBRID/REPLAY transition rules and the replay drainer

use crate::cloud::{CloudSession, SendOutcome};
use crate::config::{Config, ModeOverride};
use crate::frame::{Frame, FrameClass};
use crate::publish::{Event, FrameSink};
use crate::queue::{self, DurableQueue};
use crate::shutdown::Shutdown;
use crate::stats::Stats;
use core::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Upper bound for a hybrid probe attempt. The generous table ACK deadline
/// would hold the probe gate for half an hour; a probe only needs to learn
/// whether the cloud answers at all.
const HYBRID_PROBE_DEADLINE: Duration = Duration::from_secs(10);

/// The proxy's operating mode. Process-wide; REPLAY is a transient
/// sub-state entered only when leaving OFFLINE or HYBRID with backlog.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Online,
    Offline,
    Hybrid,
    Replay,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Online => write!(f, "online"),
            Mode::Offline => write!(f, "offline"),
            Mode::Hybrid => write!(f, "hybrid"),
            Mode::Replay => write!(f, "replay"),
        }
    }
}

impl From<ModeOverride> for Mode {
    fn from(value: ModeOverride) -> Mode {
        match value {
            ModeOverride::Auto | ModeOverride::Online => Mode::Online,
            ModeOverride::Offline => Mode::Offline,
            ModeOverride::Hybrid => Mode::Hybrid,
        }
    }
}

/// What the connection handler should do with one inbound BOX frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Send to the cloud and relay its reply; fall back locally if no
    /// ACK arrives within `fallback`.
    Forward { fallback: Duration },
    /// Write to the cloud without waiting - classes the cloud never
    /// acknowledges (BOX ACKs, END).
    ForwardOneWay,
    /// Answer with the synthesiser; buffer for later delivery when the
    /// class is queue-eligible.
    Local { enqueue: bool },
}

/// Only these edges exist in the mode graph; everything else is refused.
fn transition_allowed(from: Mode, to: Mode) -> bool {
    use Mode::*;
    matches!(
        (from, to),
        (Online, Offline)
            | (Offline, Replay)
            | (Offline, Online)
            | (Replay, Online)
            | (Replay, Offline)
            | (Hybrid, Replay)
            | (_, Hybrid)
    )
}

#[derive(Debug, Default)]
struct ProbeGate {
    in_flight: bool,
    last_attempt: Option<Instant>,
}

/// Shared decision-maker between BOX handlers, the cloud session and the
/// durable queue. All transitions are idempotent and raise an observation
/// event.
pub struct ModeEngine {
    mode_tx: watch::Sender<Mode>,
    queue: Arc<DurableQueue>,
    cloud: CloudSession,
    sink: Arc<dyn FrameSink>,
    stats: Stats,
    config: Config,
    /// Consecutive ONLINE fast fallbacks; trips the OFFLINE transition.
    fallbacks: AtomicU32,
    probe_gate: Mutex<ProbeGate>,
}

impl ModeEngine {
    pub fn new(
        config: Config,
        queue: Arc<DurableQueue>,
        cloud: CloudSession,
        sink: Arc<dyn FrameSink>,
        stats: Stats,
    ) -> Arc<ModeEngine> {
        let initial = Mode::from(config.mode_override);
        info!(mode = %initial, "mode engine starting");
        let (mode_tx, _) = watch::channel(initial);
        Arc::new(ModeEngine {
            mode_tx,
            queue,
            cloud,
            sink,
            stats,
            config,
            fallbacks: AtomicU32::new(0),
            probe_gate: Mutex::new(ProbeGate::default()),
        })
    }

    pub fn mode(&self) -> Mode {
        *self.mode_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Mode> {
        self.mode_tx.subscribe()
    }

    /// Route decision for one inbound BOX frame.
    pub fn decide(&self, class: &FrameClass) -> Action {
        match self.mode() {
            Mode::Online => {
                if class.expects_reply() {
                    Action::Forward { fallback: self.config.fallback_deadline(class) }
                } else {
                    Action::ForwardOneWay
                }
            }
            Mode::Offline | Mode::Hybrid | Mode::Replay => {
                Action::Local { enqueue: class.queue_eligible() }
            }
        }
    }

    /// Attempt a mode change. Returns true when the mode actually moved;
    /// disallowed or no-op transitions are ignored.
    pub fn transition(&self, to: Mode, reason: &str) -> bool {
        let mut from = Mode::Online;
        let changed = self.mode_tx.send_if_modified(|mode| {
            if *mode == to || !transition_allowed(*mode, to) {
                return false;
            }
            from = *mode;
            *mode = to;
            true
        });

        if changed {
            self.stats.incr_mode_transitions();
            self.fallbacks.store(0, Ordering::Relaxed);
            info!(%from, %to, reason, "mode transition");
            self.sink.publish(Event::Mode { from, to, reason: reason.to_string() });
        }
        changed
    }

    /// A live forward made it to the cloud and back.
    pub fn note_forward_ok(&self) {
        self.fallbacks.store(0, Ordering::Relaxed);
    }

    /// A live forward fell back to the synthesiser. Enough of these in a
    /// row and ONLINE is clearly not working.
    pub fn note_fallback(&self) {
        let n = self.fallbacks.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= self.config.fallback_trip && self.mode() == Mode::Online {
            self.transition(Mode::Offline, "repeated cloud fallbacks");
        }
    }

    /// Health prober input.
    pub fn on_reachability(&self, up: bool) {
        if up {
            if self.mode() == Mode::Offline {
                if self.queue.is_empty() {
                    self.transition(Mode::Online, "cloud reachable, queue empty");
                } else {
                    self.transition(Mode::Replay, "cloud reachable, queue backlog");
                }
            }
        } else if self.mode() == Mode::Online {
            self.transition(Mode::Offline, "health probe reports down");
        }
    }

    /// In HYBRID, try the cloud once per retry interval without ever
    /// putting the BOX on the cloud's latency. The probe frame is the
    /// queue head when there is backlog (success counts as its delivery,
    /// preserving FIFO) or a clone of the live frame otherwise.
    pub fn maybe_hybrid_probe(self: &Arc<Self>, live: &Frame) {
        if self.mode() != Mode::Hybrid {
            return;
        }
        {
            let mut gate = self.probe_gate.lock().expect("probe gate poisoned");
            if gate.in_flight {
                return;
            }
            if let Some(last) = gate.last_attempt {
                if last.elapsed() < self.config.hybrid_retry_interval {
                    return;
                }
            }
            gate.in_flight = true;
            gate.last_attempt = Some(Instant::now());
        }

        let (raw, class, queued_id) = match self.queue.peek_next(queue::now_ms()) {
            Some(entry) => (entry.frame_bytes(), entry.class.clone(), Some(entry.id)),
            None => (live.raw.clone(), live.class.clone(), None),
        };

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            debug!(?class, "hybrid probe attempt");
            let outcome = engine
                .cloud
                .send_and_wait_ack(raw, class, HYBRID_PROBE_DEADLINE)
                .await;
            match outcome {
                SendOutcome::Acked(_) => {
                    if let Some(id) = queued_id {
                        log_queue_err(engine.queue.mark_sent(id));
                    }
                    engine.transition(Mode::Replay, "hybrid probe succeeded");
                }
                SendOutcome::Nacked(_) => {
                    // The cloud answered, so it is alive; it just refused
                    // this particular frame.
                    if let Some(id) = queued_id {
                        warn!(id, "cloud NACKed probe frame, dropping it");
                        log_queue_err(engine.queue.drop_entry(id, "cloud-nack"));
                    }
                    engine.transition(Mode::Replay, "hybrid probe succeeded");
                }
                other => {
                    debug!(outcome = ?other, "hybrid probe failed, staying put");
                }
            }
            engine.probe_gate.lock().expect("probe gate poisoned").in_flight = false;
        });
    }

    /// Replay worker: the single drainer for the queue. Runs for the life
    /// of the process and wakes whenever the mode enters REPLAY. Live BOX
    /// traffic keeps appending to the tail while this drains the head, so
    /// the cloud sees one strictly ordered stream.
    pub async fn run_drainer(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut mode_rx = self.mode_tx.subscribe();

        while !shutdown.is_shutdown() {
            if *mode_rx.borrow_and_update() != Mode::Replay {
                tokio::select! {
                    res = mode_rx.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
                continue;
            }

            self.cloud.set_draining(true).await;
            info!(backlog = self.queue.size(), "replay started");
            self.drain(&mut shutdown).await;
            self.cloud.set_draining(false).await;
        }
        debug!("replay drainer stopped");
    }

    async fn drain(&self, shutdown: &mut Shutdown) {
        while self.mode() == Mode::Replay && !shutdown.is_shutdown() {
            let now = queue::now_ms();
            let Some(entry) = self.queue.peek_next(now) else {
                if self.queue.is_empty() {
                    self.transition(Mode::Online, "queue drained");
                    return;
                }
                // Head is backing off; sleep until it becomes deliverable.
                let wait = self
                    .queue
                    .next_not_before()
                    .map(|nb| nb.saturating_sub(now))
                    .unwrap_or(250)
                    .clamp(50, 5_000);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(wait)) => {}
                    _ = shutdown.recv() => return,
                }
                continue;
            };

            let deadline = self.config.ack_deadline(&entry.class);
            let outcome = self
                .cloud
                .send_and_wait_ack(entry.frame_bytes(), entry.class.clone(), deadline)
                .await;
            match outcome {
                SendOutcome::Acked(_) => {
                    debug!(id = entry.id, "replayed entry acknowledged");
                    log_queue_err(self.queue.mark_sent(entry.id));
                }
                SendOutcome::Nacked(frame) => {
                    warn!(
                        id = entry.id,
                        reason = frame.new_value.as_deref().unwrap_or("NACK"),
                        "cloud refused replayed entry, dropping"
                    );
                    log_queue_err(self.queue.drop_entry(entry.id, "cloud-nack"));
                }
                SendOutcome::Timeout => {
                    log_queue_err(self.queue.defer(entry.id, queue::now_ms()).map(|_| ()));
                }
                SendOutcome::Eof | SendOutcome::Io(_) => {
                    log_queue_err(self.queue.defer(entry.id, queue::now_ms()).map(|_| ()));
                    self.transition(Mode::Offline, "cloud send failed during drain");
                    return;
                }
            }
        }
    }
}

fn log_queue_err<E: std::fmt::Display>(res: Result<(), E>) {
    if let Err(e) = res {
        error!(error = %e, "queue update failed");
    }
}

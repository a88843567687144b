// ABOUTME: Out-of-band cloud reachability probe with two-sided hysteresis
// ABOUTME: Plain TCP connect at a fixed cadence, no protocol bytes, off by default

use crate::shutdown::Shutdown;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info};

/// Configuration for the reachability probe.
///
/// Disabled by default: a probe is traffic the BOX did not originate, and
/// stealth deployments must not betray the proxy's presence to the cloud.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Whether the probe runs at all (default: false).
    pub enabled: bool,
    /// Interval between connect attempts (default: 30 seconds).
    pub interval: Duration,
    /// Timeout for one connect attempt (default: 2 seconds).
    pub timeout: Duration,
    /// Consecutive successes before down flips to up (default: 2).
    pub up_threshold: u32,
    /// Consecutive failures before up flips to down (default: 3).
    pub down_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
            up_threshold: 2,
            down_threshold: 3,
        }
    }
}

/// Two-sided debounce over a boolean signal.
///
/// A single failed connect must not flap the mode engine into OFFLINE,
/// and a single lucky success must not flip it back. `record` returns the
/// new state only when it actually changed.
#[derive(Debug)]
pub struct Hysteresis {
    state: bool,
    successes: u32,
    failures: u32,
    up_threshold: u32,
    down_threshold: u32,
}

impl Hysteresis {
    pub fn new(initial: bool, up_threshold: u32, down_threshold: u32) -> Hysteresis {
        Hysteresis {
            state: initial,
            successes: 0,
            failures: 0,
            // A threshold of 0 would flip without evidence; clamp to 1.
            up_threshold: up_threshold.max(1),
            down_threshold: down_threshold.max(1),
        }
    }

    pub fn state(&self) -> bool {
        self.state
    }

    /// Feed one observation. Returns `Some(new_state)` on a flip.
    pub fn record(&mut self, ok: bool) -> Option<bool> {
        if ok {
            self.failures = 0;
            self.successes += 1;
            if !self.state && self.successes >= self.up_threshold {
                self.state = true;
                return Some(true);
            }
        } else {
            self.successes = 0;
            self.failures += 1;
            if self.state && self.failures >= self.down_threshold {
                self.state = false;
                return Some(false);
            }
        }
        None
    }
}

/// Probe task body. Emits `cloud_reachable` flips on `reachable_tx`.
///
/// One probe is a TCP connect immediately followed by a close; no protocol
/// bytes are ever sent.
pub async fn run(
    config: ProbeConfig,
    addr: String,
    reachable_tx: watch::Sender<bool>,
    mut shutdown: Shutdown,
) {
    if !config.enabled {
        debug!("health probe disabled");
        return;
    }

    // Start from the optimistic side so a healthy boot doesn't force a
    // spurious OFFLINE round-trip.
    let mut hysteresis =
        Hysteresis::new(true, config.up_threshold, config.down_threshold);
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(addr = %addr, interval = ?config.interval, "health probe started");
    while !shutdown.is_shutdown() {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => break,
        }

        let ok = matches!(
            timeout(config.timeout, TcpStream::connect(&addr)).await,
            Ok(Ok(_))
        );
        debug!(ok, "health probe attempt");
        if let Some(up) = hysteresis.record(ok) {
            info!(reachable = up, "cloud reachability changed");
            reachable_tx.send_replace(up);
        }
    }
}

// ABOUTME: Process-wide counters for proxy observability
// ABOUTME: Cheap atomic handle shared by every component, snapshot for the telemetry reporter

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter set shared across the proxy. Cloning is cheap (one `Arc`).
///
/// Counters only ever increase; consumers take a [`Stats::snapshot`] and
/// diff against a previous one. Relaxed ordering is sufficient - nothing
/// synchronises through these values.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    frames_from_box: AtomicU64,
    frames_from_cloud: AtomicU64,
    frames_to_box: AtomicU64,
    frames_to_cloud: AtomicU64,
    parse_errors: AtomicU64,
    crc_errors: AtomicU64,
    local_acks: AtomicU64,
    cloud_fallbacks: AtomicU64,
    queue_overflow: AtomicU64,
    queue_exhausted: AtomicU64,
    queue_replayed: AtomicU64,
    publish_dropped: AtomicU64,
    mode_transitions: AtomicU64,
    settings_acked: AtomicU64,
    settings_failed: AtomicU64,
    settings_expired: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub frames_from_box: u64,
    pub frames_from_cloud: u64,
    pub frames_to_box: u64,
    pub frames_to_cloud: u64,
    pub parse_errors: u64,
    pub crc_errors: u64,
    pub local_acks: u64,
    pub cloud_fallbacks: u64,
    pub queue_overflow: u64,
    pub queue_exhausted: u64,
    pub queue_replayed: u64,
    pub publish_dropped: u64,
    pub mode_transitions: u64,
    pub settings_acked: u64,
    pub settings_failed: u64,
    pub settings_expired: u64,
}

macro_rules! bump {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.inner.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    bump! {
        incr_frames_from_box => frames_from_box,
        incr_frames_from_cloud => frames_from_cloud,
        incr_frames_to_box => frames_to_box,
        incr_frames_to_cloud => frames_to_cloud,
        incr_parse_errors => parse_errors,
        incr_crc_errors => crc_errors,
        incr_local_acks => local_acks,
        incr_cloud_fallbacks => cloud_fallbacks,
        incr_queue_overflow => queue_overflow,
        incr_queue_exhausted => queue_exhausted,
        incr_queue_replayed => queue_replayed,
        incr_publish_dropped => publish_dropped,
        incr_mode_transitions => mode_transitions,
        incr_settings_acked => settings_acked,
        incr_settings_failed => settings_failed,
        incr_settings_expired => settings_expired,
    }

    pub fn snapshot(&self) -> Snapshot {
        let c = &self.inner;
        Snapshot {
            frames_from_box: c.frames_from_box.load(Ordering::Relaxed),
            frames_from_cloud: c.frames_from_cloud.load(Ordering::Relaxed),
            frames_to_box: c.frames_to_box.load(Ordering::Relaxed),
            frames_to_cloud: c.frames_to_cloud.load(Ordering::Relaxed),
            parse_errors: c.parse_errors.load(Ordering::Relaxed),
            crc_errors: c.crc_errors.load(Ordering::Relaxed),
            local_acks: c.local_acks.load(Ordering::Relaxed),
            cloud_fallbacks: c.cloud_fallbacks.load(Ordering::Relaxed),
            queue_overflow: c.queue_overflow.load(Ordering::Relaxed),
            queue_exhausted: c.queue_exhausted.load(Ordering::Relaxed),
            queue_replayed: c.queue_replayed.load(Ordering::Relaxed),
            publish_dropped: c.publish_dropped.load(Ordering::Relaxed),
            mode_transitions: c.mode_transitions.load(Ordering::Relaxed),
            settings_acked: c.settings_acked.load(Ordering::Relaxed),
            settings_failed: c.settings_failed.load(Ordering::Relaxed),
            settings_expired: c.settings_expired.load(Ordering::Relaxed),
        }
    }
}

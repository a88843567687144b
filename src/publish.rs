// ABOUTME: Observation-sink interface and control-source types at the proxy boundary
// ABOUTME: The MQTT layer lives behind these types; the core only sees traits and channels

use crate::frame::{Frame, FrameClass};
use crate::stats::Stats;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core::fmt;
use tokio::sync::mpsc;
use tracing::debug;

/// Which side of the proxy a frame was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    FromBox,
    FromCloud,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::FromBox => write!(f, "box"),
            Direction::FromCloud => write!(f, "cloud"),
        }
    }
}

/// One parsed frame as seen by the observation sink.
#[derive(Clone, Debug)]
pub struct FrameEvent {
    pub direction: Direction,
    pub timestamp: DateTime<Utc>,
    pub device_id: Option<String>,
    pub class: FrameClass,
    pub raw: Bytes,
    pub result: Option<String>,
    pub reason: Option<String>,
    pub tbl_name: Option<String>,
    pub tbl_item: Option<String>,
    pub new_value: Option<String>,
}

impl FrameEvent {
    pub fn from_frame(direction: Direction, frame: &Frame) -> Self {
        FrameEvent {
            direction,
            timestamp: Utc::now(),
            device_id: frame.id_device.clone(),
            class: frame.class.clone(),
            raw: frame.raw.clone(),
            result: frame.result.clone(),
            reason: frame.reason.clone(),
            tbl_name: frame.tbl_name.clone(),
            tbl_item: frame.tbl_item.clone(),
            new_value: frame.new_value.clone(),
        }
    }
}

/// Everything the core emits towards the publisher.
#[derive(Clone, Debug)]
pub enum Event {
    /// A frame crossed the proxy (either direction).
    Frame(FrameEvent),
    /// The mode engine changed state.
    Mode { from: crate::mode::Mode, to: crate::mode::Mode, reason: String },
    /// A control request reached a new state.
    Control(ControlUpdate),
}

/// Sink consuming proxy events. Implementations MUST NOT block; they may
/// drop under pressure (drops are counted by the caller's [`Stats`]).
pub trait FrameSink: Send + Sync {
    /// Hand one event to the sink. Returns `false` if the event was
    /// dropped, `true` if it was accepted.
    fn publish(&self, event: Event) -> bool;
}

/// [`FrameSink`] backed by a bounded tokio channel. Overflow drops the
/// event (never the sender's time); drops are counted.
pub struct ChannelSink {
    tx: mpsc::Sender<Event>,
    stats: Stats,
}

impl ChannelSink {
    /// Create a sink with the given queue depth; the receiver half is what
    /// the publisher task consumes.
    pub fn new(depth: usize, stats: Stats) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(depth);
        (ChannelSink { tx, stats }, rx)
    }
}

impl FrameSink for ChannelSink {
    fn publish(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.stats.incr_publish_dropped();
                debug!("observation sink full, event dropped");
                false
            }
        }
    }
}

/// Sink that discards everything. Used in tests and when no publisher is
/// configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn publish(&self, _event: Event) -> bool {
        true
    }
}

/// A high-level control request from the publisher side:
/// "set TBL.ITEM = VALUE".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    pub correlation_id: String,
    pub tbl_name: String,
    pub tbl_item: String,
    pub new_value: String,
}

/// Status of a control request as reported back to the source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlStatus {
    Queued,
    Acked,
    Failed,
    Expired,
}

impl fmt::Display for ControlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlStatus::Queued => write!(f, "queued"),
            ControlStatus::Acked => write!(f, "acked"),
            ControlStatus::Failed => write!(f, "failed"),
            ControlStatus::Expired => write!(f, "expired"),
        }
    }
}

/// Progress report for one control request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlUpdate {
    pub correlation_id: String,
    pub status: ControlStatus,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_frame;

    fn sample_frame() -> Frame {
        crate::codec::parse(build_frame(
            "<ID_Device>42</ID_Device><Result>IsNewSet</Result>",
        ))
        .unwrap()
    }

    #[test]
    fn test_frame_event_carries_parsed_fields() {
        let frame = sample_frame();
        let event = FrameEvent::from_frame(Direction::FromBox, &frame);
        assert_eq!(event.device_id.as_deref(), Some("42"));
        assert_eq!(event.result.as_deref(), Some("IsNewSet"));
        assert_eq!(event.raw, frame.raw);
    }

    #[tokio::test]
    async fn test_channel_sink_drops_on_overflow() {
        let stats = Stats::new();
        let (sink, mut rx) = ChannelSink::new(1, stats.clone());
        let event = Event::Frame(FrameEvent::from_frame(Direction::FromBox, &sample_frame()));

        assert!(sink.publish(event.clone()));
        assert!(!sink.publish(event.clone()));
        assert_eq!(stats.snapshot().publish_dropped, 1);

        // Draining frees a slot again.
        rx.recv().await.unwrap();
        assert!(sink.publish(event));
    }
}

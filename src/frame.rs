//! Provides a type representing a parsed BOX protocol frame as well as the
//! signal-class taxonomy used for routing and local acknowledgement.

use bytes::Bytes;
use core::fmt;
use serde::{Deserialize, Serialize};

/// The three poll variants a BOX emits to solicit a cloud reply.
///
/// The cloud's observed behaviour is to echo the same `Result` tag back
/// with no payload, so the variant doubles as the echo template.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollKind {
    NewFw,
    NewSet,
    NewWeather,
}

impl PollKind {
    /// The `Result` tag text for this poll on the wire.
    pub fn result_tag(&self) -> &'static str {
        match self {
            PollKind::NewFw => "IsNewFW",
            PollKind::NewSet => "IsNewSet",
            PollKind::NewWeather => "IsNewWeather",
        }
    }

    /// Map a `Result` tag back to a poll variant, if it is one.
    pub fn from_result_tag(tag: &str) -> Option<PollKind> {
        match tag {
            "IsNewFW" => Some(PollKind::NewFw),
            "IsNewSet" => Some(PollKind::NewSet),
            "IsNewWeather" => Some(PollKind::NewWeather),
            _ => None,
        }
    }
}

/// Derived classification of a frame, used by the mode engine, the queue's
/// eligibility filter and the ACK synthesiser.
///
/// New classes are additive: anything the classifier does not recognise
/// lands in `Unknown` and is treated like table data (acknowledged and
/// forwarded, never dropped silently).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameClass {
    /// `IsNewFW` / `IsNewSet` / `IsNewWeather` solicitation.
    Poll(PollKind),
    /// `Result=ACK` sent by the BOX towards the cloud. One-way; never echoed.
    AckFromBox,
    /// `Result=NACK` sent by the BOX, e.g. refusing a setting.
    Nack,
    /// `Result=END` connection teardown. The cloud never replies to these.
    End,
    /// Outbound settings carry `Reason=Setting` plus table coordinates.
    Setting,
    /// Table payload (`tbl_*_prms`, `tbl_events`, `tbl_actual`, ...).
    TableData,
    /// Anything the classifier does not recognise.
    Unknown,
}

impl FrameClass {
    /// Whether frames of this class may be buffered for later cloud
    /// delivery. `END` frames exist solely to tear a session down and the
    /// cloud does not ACK them; queuing them wastes slots and perpetually
    /// re-triggers replay.
    pub fn queue_eligible(&self) -> bool {
        !matches!(self, FrameClass::End)
    }

    /// Whether the BOX expects any reply at all for this class.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, FrameClass::End | FrameClass::AckFromBox | FrameClass::Nack)
    }
}

impl fmt::Display for FrameClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameClass::Poll(kind) => write!(f, "poll/{}", kind.result_tag()),
            FrameClass::AckFromBox => write!(f, "ack"),
            FrameClass::Nack => write!(f, "nack"),
            FrameClass::End => write!(f, "end"),
            FrameClass::Setting => write!(f, "setting"),
            FrameClass::TableData => write!(f, "table"),
            FrameClass::Unknown => write!(f, "unknown"),
        }
    }
}

/// A single parsed protocol frame.
///
/// Immutable once built. `raw` holds the exact bytes as seen on the wire
/// (or as built for sending) including the `<Frame>` envelope and CRC tag,
/// so forwarding stays byte-for-byte. The tag fields are best-effort:
/// missing tags parse to `None`, unknown tags are ignored.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Complete wire bytes, `<Frame>` ... `</Frame>` inclusive.
    pub raw: Bytes,
    /// Derived signal class.
    pub class: FrameClass,
    /// `Result` tag (`IsNewSet`, `ACK`, `END`, ...). Absent on table frames.
    pub result: Option<String>,
    /// `Reason` tag, notably `Setting` on setting ACK/NACK exchanges.
    pub reason: Option<String>,
    /// `TblName` tag, set on table payloads and setting frames.
    pub tbl_name: Option<String>,
    /// `TblItem` tag, set on setting frames.
    pub tbl_item: Option<String>,
    /// `NewValue` tag, set on setting frames and NACK detail.
    pub new_value: Option<String>,
    /// Frame envelope id.
    pub id: Option<String>,
    /// Originating device id.
    pub id_device: Option<String>,
    /// Setting correlation id.
    pub id_set: Option<String>,
    /// Wall-clock timestamp in the protocol's local format.
    pub dt: Option<String>,
    /// Protocol version tag.
    pub ver: Option<String>,
    /// The declared CRC value (already verified by the codec).
    pub crc: u32,
}

impl Frame {
    /// Classify a frame from its extracted tags. `Result` wins; a frame
    /// with no `Result` but a `tbl_*` table name is table data.
    pub fn classify(
        result: Option<&str>,
        reason: Option<&str>,
        tbl_name: Option<&str>,
    ) -> FrameClass {
        if let Some(result) = result {
            if let Some(kind) = PollKind::from_result_tag(result) {
                return FrameClass::Poll(kind);
            }
            return match result {
                "ACK" => FrameClass::AckFromBox,
                "NACK" => FrameClass::Nack,
                "END" => FrameClass::End,
                _ => FrameClass::Unknown,
            };
        }
        if reason == Some("Setting") {
            return FrameClass::Setting;
        }
        match tbl_name {
            Some(name) if name.starts_with("tbl_") => FrameClass::TableData,
            _ => FrameClass::Unknown,
        }
    }

    /// True when this frame is a setting acknowledgement from the BOX:
    /// `Result=ACK` combined with `Reason=Setting`. A bare ACK without the
    /// reason does not count.
    pub fn is_setting_ack(&self) -> bool {
        self.class == FrameClass::AckFromBox && self.reason.as_deref() == Some("Setting")
    }

    /// True when this frame is an explicit setting refusal:
    /// `Result=NACK` combined with `Reason=Setting`.
    pub fn is_setting_nack(&self) -> bool {
        self.class == FrameClass::Nack && self.reason.as_deref() == Some("Setting")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_polls() {
        for (tag, kind) in [
            ("IsNewFW", PollKind::NewFw),
            ("IsNewSet", PollKind::NewSet),
            ("IsNewWeather", PollKind::NewWeather),
        ] {
            assert_eq!(Frame::classify(Some(tag), None, None), FrameClass::Poll(kind));
        }
    }

    #[test]
    fn test_classify_result_tags() {
        assert_eq!(Frame::classify(Some("ACK"), None, None), FrameClass::AckFromBox);
        assert_eq!(Frame::classify(Some("NACK"), None, None), FrameClass::Nack);
        assert_eq!(Frame::classify(Some("END"), None, None), FrameClass::End);
        assert_eq!(Frame::classify(Some("Bogus"), None, None), FrameClass::Unknown);
    }

    #[test]
    fn test_classify_table_data() {
        assert_eq!(
            Frame::classify(None, None, Some("tbl_box_prms")),
            FrameClass::TableData
        );
        assert_eq!(
            Frame::classify(None, None, Some("tbl_events")),
            FrameClass::TableData
        );
        assert_eq!(Frame::classify(None, None, Some("weird")), FrameClass::Unknown);
        assert_eq!(Frame::classify(None, None, None), FrameClass::Unknown);
    }

    #[test]
    fn test_classify_setting() {
        assert_eq!(
            Frame::classify(None, Some("Setting"), Some("tbl_box_prms")),
            FrameClass::Setting
        );
        // Result still wins over Reason
        assert_eq!(
            Frame::classify(Some("ACK"), Some("Setting"), None),
            FrameClass::AckFromBox
        );
    }

    #[test]
    fn test_queue_eligibility() {
        assert!(!FrameClass::End.queue_eligible());
        assert!(FrameClass::Poll(PollKind::NewSet).queue_eligible());
        assert!(FrameClass::TableData.queue_eligible());
        assert!(FrameClass::AckFromBox.queue_eligible());
    }

    #[test]
    fn test_reply_expectation() {
        assert!(FrameClass::Poll(PollKind::NewFw).expects_reply());
        assert!(FrameClass::TableData.expects_reply());
        assert!(!FrameClass::End.expects_reply());
        assert!(!FrameClass::AckFromBox.expects_reply());
    }
}

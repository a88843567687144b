// ABOUTME: Local ACK synthesiser - builds responses the BOX accepts in place of cloud replies
// ABOUTME: Pure component, no I/O, no state beyond a monotonic envelope-id counter

use crate::codec::build_frame;
use crate::frame::{Frame, FrameClass};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic envelope-id source shared by the synthesiser and the control
/// pipeline. The BOX correlates poorly with reused ids, so every generated
/// frame gets a fresh one.
#[derive(Debug)]
pub struct IdGen {
    counter: AtomicU64,
}

impl IdGen {
    pub fn new() -> Arc<IdGen> {
        // Seed away from zero; id 0 has shown up as a sentinel in captures.
        Arc::new(IdGen { counter: AtomicU64::new(1) })
    }

    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

/// Builds protocol-valid responses for frames the cloud is not around to
/// answer. Rules per incoming class:
///
/// - *poll*: echo the same `Result` tag with a fresh `ID`, no payload -
///   exactly what the cloud does.
/// - *table data* (and unrecognised frames): a minimal `ACK` envelope the
///   BOX accepts as a receipt.
/// - *END*, *ACK*, *NACK*: nothing; the BOX expects no reply.
#[derive(Clone, Debug)]
pub struct Synthesiser {
    ids: Arc<IdGen>,
}

impl Synthesiser {
    pub fn new(ids: Arc<IdGen>) -> Synthesiser {
        Synthesiser { ids }
    }

    /// Compute the response for `frame`, or `None` when the class gets no
    /// reply. The returned bytes are a complete wire frame with valid CRC.
    pub fn respond(&self, frame: &Frame) -> Option<Bytes> {
        match &frame.class {
            FrameClass::Poll(kind) => {
                let inner = format!(
                    "<ID>{}</ID><Result>{}</Result>",
                    self.fresh_id(frame),
                    kind.result_tag()
                );
                Some(build_frame(&inner))
            }
            FrameClass::TableData | FrameClass::Unknown => {
                let inner = format!("<ID>{}</ID><Result>ACK</Result>", self.fresh_id(frame));
                Some(build_frame(&inner))
            }
            FrameClass::End
            | FrameClass::AckFromBox
            | FrameClass::Nack
            | FrameClass::Setting => None,
        }
    }

    /// An id guaranteed to differ from the incoming frame's own `ID`; an
    /// echo that mirrors the id back marks the reply as ours, not the
    /// cloud's.
    fn fresh_id(&self, frame: &Frame) -> u64 {
        let id = self.ids.next();
        if frame.id.as_deref() == Some(id.to_string().as_str()) {
            self.ids.next()
        } else {
            id
        }
    }

    /// Minimum time between receiving a frame and writing the synthesised
    /// response. Real cloud replies are never instantaneous; answering in
    /// the same microsecond would betray the proxy. The caller enforces
    /// the floor at the write site - the synthesiser itself never sleeps.
    pub fn response_floor(class: &FrameClass) -> Duration {
        match class {
            FrameClass::Poll(_) => Duration::from_millis(4),
            _ => Duration::from_millis(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::frame::PollKind;

    fn parse(raw: Bytes) -> Frame {
        codec::parse(raw).unwrap()
    }

    fn incoming(inner: &str) -> Frame {
        parse(build_frame(inner))
    }

    #[test]
    fn test_poll_echoes_same_result_with_fresh_id() {
        let synth = Synthesiser::new(IdGen::new());
        for tag in ["IsNewFW", "IsNewSet", "IsNewWeather"] {
            let input = incoming(&format!("<ID>900</ID><Result>{tag}</Result>"));
            let reply = parse(synth.respond(&input).unwrap());

            assert_eq!(reply.result.as_deref(), Some(tag));
            assert!(reply.id.is_some());
            assert_ne!(reply.id, input.id);
            // parse() verifies the CRC, so reaching here means it is valid
            assert_eq!(reply.class, input.class);
        }
    }

    #[test]
    fn test_table_data_gets_plain_ack() {
        let synth = Synthesiser::new(IdGen::new());
        let input = incoming("<TblName>tbl_actual</TblName><Row>1</Row>");
        let reply = parse(synth.respond(&input).unwrap());
        assert_eq!(reply.result.as_deref(), Some("ACK"));
        assert_eq!(reply.class, FrameClass::AckFromBox);
    }

    #[test]
    fn test_silent_classes_get_no_reply() {
        let synth = Synthesiser::new(IdGen::new());
        for inner in [
            "<Result>END</Result>",
            "<Result>ACK</Result>",
            "<Result>NACK</Result>",
        ] {
            assert!(synth.respond(&incoming(inner)).is_none());
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = IdGen::new();
        let synth = Synthesiser::new(ids);
        let poll = incoming("<Result>IsNewSet</Result>");
        let first = parse(synth.respond(&poll).unwrap());
        let second = parse(synth.respond(&poll).unwrap());
        let a: u64 = first.id.unwrap().parse().unwrap();
        let b: u64 = second.id.unwrap().parse().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_echo_id_never_mirrors_input_id() {
        // Counter starts at 1; an incoming frame with ID 1 must not get
        // an echo that reuses it.
        let synth = Synthesiser::new(IdGen::new());
        let input = incoming("<ID>1</ID><Result>IsNewSet</Result>");
        let reply = parse(synth.respond(&input).unwrap());
        assert_ne!(reply.id, input.id);
    }

    #[test]
    fn test_response_floor_windows() {
        assert_eq!(
            Synthesiser::response_floor(&FrameClass::Poll(PollKind::NewFw)),
            Duration::from_millis(4)
        );
        assert_eq!(
            Synthesiser::response_floor(&FrameClass::TableData),
            Duration::from_millis(10)
        );
    }
}

// ABOUTME: Wire codec for the BOX XML frame protocol - extraction, CRC and field parsing
// ABOUTME: Separates byte-stream framing from the parsed Frame domain model

use crate::frame::{Frame, FrameClass};
use bytes::{Buf, Bytes, BytesMut};
use quick_xml::Reader;
use quick_xml::events::Event;
use thiserror::Error;
use tracing::debug;

/// Opening tag delimiting a frame on the wire.
pub const OPEN_TAG: &[u8] = b"<Frame>";
/// Closing tag delimiting a frame on the wire.
pub const CLOSE_TAG: &[u8] = b"</Frame>";

/// Maximum bytes a single frame may occupy before the stream is considered
/// garbage and resynchronised. Table payloads are the largest real frames
/// and stay well under this.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Codec errors with enough context for the per-frame error counters.
///
/// All of these are non-fatal: the offending bytes are skipped and the
/// stream resynchronises on the next `<Frame>` marker.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame has no CRC tag")]
    MissingCrc,

    #[error("frame CRC is not five decimal digits: {0:?}")]
    InvalidCrc(String),

    #[error("frame CRC mismatch: declared {declared:05}, computed {computed:05}")]
    CrcMismatch { declared: u32, computed: u32 },

    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("malformed frame XML: {0}")]
    Malformed(String),

    #[error("frame exceeds the maximum frame size")]
    Oversized,
}

/// CRC over an inner payload: the byte-value sum, kept to five decimal
/// digits. Formatted zero-padded on the wire (`<CRC>00123</CRC>`).
pub fn checksum(inner: &[u8]) -> u32 {
    (inner.iter().map(|&b| b as u64).sum::<u64>() % 100_000) as u32
}

/// Build a complete wire frame around `inner`: compute the CRC over the
/// inner payload and wrap it as `<Frame>inner<CRC>NNNNN</CRC></Frame>`.
///
/// ```
/// let raw = boxgate::codec::build_frame("<Result>ACK</Result>");
/// assert!(raw.starts_with(b"<Frame><Result>ACK</Result><CRC>"));
/// assert!(raw.ends_with(b"</CRC></Frame>"));
/// ```
pub fn build_frame(inner: &str) -> Bytes {
    let crc = checksum(inner.as_bytes());
    let mut out = String::with_capacity(inner.len() + OPEN_TAG.len() + CLOSE_TAG.len() + 22);
    out.push_str("<Frame>");
    out.push_str(inner);
    out.push_str("<CRC>");
    out.push_str(&format!("{crc:05}"));
    out.push_str("</CRC>");
    out.push_str("</Frame>");
    Bytes::from(out)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Extract the next complete raw frame from an append-only read buffer.
///
/// Leading junk is tolerated by searching for the next `<Frame>` marker;
/// skipped bytes are discarded from the buffer. Returns `None` while no
/// complete frame is buffered yet. The returned bytes are the exact wire
/// bytes including both delimiters; the residual tail stays in `buf` for
/// the next call.
pub fn extract(buf: &mut BytesMut) -> Result<Option<Bytes>, CodecError> {
    // Align the buffer to the next opening tag, discarding junk.
    match find(buf, OPEN_TAG) {
        Some(0) => {}
        Some(start) => {
            debug!(skipped = start, "discarded junk before frame start");
            buf.advance(start);
        }
        None => {
            // No opening tag anywhere. Keep only a tail short enough to
            // hold a split `<Frame>` marker so the buffer stays bounded.
            let keep = (OPEN_TAG.len() - 1).min(buf.len());
            let junk = buf.len() - keep;
            if junk > 0 {
                debug!(skipped = junk, "discarded junk, no frame start in buffer");
                buf.advance(junk);
            }
            return Ok(None);
        }
    }

    match find(buf, CLOSE_TAG) {
        Some(end) => {
            let total = end + CLOSE_TAG.len();
            Ok(Some(buf.split_to(total).freeze()))
        }
        None if buf.len() > MAX_FRAME_SIZE => {
            // Runaway frame with no closing tag in sight. Drop the opening
            // marker so the next call resynchronises further on.
            buf.advance(OPEN_TAG.len());
            Err(CodecError::Oversized)
        }
        None => Ok(None),
    }
}

#[derive(Default)]
struct Fields {
    result: Option<String>,
    reason: Option<String>,
    tbl_name: Option<String>,
    tbl_item: Option<String>,
    new_value: Option<String>,
    id: Option<String>,
    id_device: Option<String>,
    id_set: Option<String>,
    dt: Option<String>,
    ver: Option<String>,
}

impl Fields {
    fn set(&mut self, tag: &str, text: String) {
        match tag {
            "Result" => self.result = Some(text),
            "Reason" => self.reason = Some(text),
            "TblName" => self.tbl_name = Some(text),
            "TblItem" => self.tbl_item = Some(text),
            "NewValue" => self.new_value = Some(text),
            "ID" => self.id = Some(text),
            "ID_Device" => self.id_device = Some(text),
            "ID_Set" => self.id_set = Some(text),
            "DT" => self.dt = Some(text),
            "ver" => self.ver = Some(text),
            // Unknown tags fall through; nested table rows land here too
            // and stay untouched inside `raw`.
            _ => {}
        }
    }
}

/// Parse a raw wire frame (as returned by [`extract`]) into a [`Frame`].
///
/// The CRC is verified first: it covers every byte between the `<Frame>`
/// marker and the `<CRC>` tag. Field parsing is tolerant - unknown tags
/// are ignored and missing tags yield `None`, never an error.
pub fn parse(raw: Bytes) -> Result<Frame, CodecError> {
    if raw.len() > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized);
    }
    let crc_start = find(&raw, b"<CRC>").ok_or(CodecError::MissingCrc)?;
    let crc_text_start = crc_start + b"<CRC>".len();
    let crc_text_end = crc_text_start
        + find(&raw[crc_text_start..], b"</CRC>").ok_or(CodecError::MissingCrc)?;

    let crc_text = std::str::from_utf8(&raw[crc_text_start..crc_text_end])?;
    if crc_text.len() != 5 || !crc_text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CodecError::InvalidCrc(crc_text.to_string()));
    }
    let declared: u32 = crc_text
        .parse()
        .map_err(|_| CodecError::InvalidCrc(crc_text.to_string()))?;

    let inner = &raw[OPEN_TAG.len()..crc_start];
    let computed = checksum(inner);
    if declared != computed {
        return Err(CodecError::CrcMismatch { declared, computed });
    }

    let doc = std::str::from_utf8(&raw)?;
    let fields = extract_fields(doc)?;
    let class = Frame::classify(
        fields.result.as_deref(),
        fields.reason.as_deref(),
        fields.tbl_name.as_deref(),
    );

    Ok(Frame {
        raw,
        class,
        result: fields.result,
        reason: fields.reason,
        tbl_name: fields.tbl_name,
        tbl_item: fields.tbl_item,
        new_value: fields.new_value,
        id: fields.id,
        id_device: fields.id_device,
        id_set: fields.id_set,
        dt: fields.dt,
        ver: fields.ver,
        crc: declared,
    })
}

/// Walk the XML once and pick out the direct children of `<Frame>`.
/// Deeper nesting (table rows) is deliberately skipped.
fn extract_fields(doc: &str) -> Result<Fields, CodecError> {
    let mut reader = Reader::from_str(doc);
    reader.config_mut().trim_text(true);

    let mut fields = Fields::default();
    let mut depth = 0usize;
    let mut current: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                depth += 1;
                current = if depth == 2 {
                    Some(String::from_utf8_lossy(e.name().as_ref()).into_owned())
                } else {
                    None
                };
            }
            Ok(Event::End(_)) => {
                depth = depth.saturating_sub(1);
                current = None;
            }
            Ok(Event::Text(t)) => {
                if let Some(tag) = current.as_deref() {
                    let text = t
                        .unescape()
                        .map_err(|e| CodecError::Malformed(e.to_string()))?
                        .into_owned();
                    fields.set(tag, text);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(CodecError::Malformed(e.to_string())),
            _ => {}
        }
    }

    Ok(fields)
}

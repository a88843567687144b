// ABOUTME: Provides TCP connection management for the BOX XML frame protocol
// ABOUTME: Implements frame-based I/O with buffering and in-stream resynchronisation

use crate::codec::{self, CodecError};
use crate::frame::Frame;
use crate::stats::Stats;
use bytes::BytesMut;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::warn;

/// Frame-level wrapper around one TCP socket.
///
/// Both sides of the proxy speak the same wire protocol, so the BOX-facing
/// handler and the cloud session share this type. Reads are buffered into
/// a `BytesMut` and scanned for complete `<Frame>...</Frame>` units;
/// writes go through a `BufWriter` and are flushed per frame so a frame is
/// never interleaved with another writer's bytes.
///
/// Malformed or CRC-invalid frames are counted, skipped and never
/// terminate the connection - the BOX keeps talking through our parse
/// errors, and so must we.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,

    // The buffer for reading frames.
    buffer: BytesMut,

    stats: Stats,
}

impl Connection {
    /// Create a new `Connection`, backed by `socket`. Read and write
    /// buffers are initialized.
    pub fn new(socket: TcpStream, stats: Stats) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            // 16KB default: table payloads are the common large frame and
            // usually fit without a reallocation.
            buffer: BytesMut::with_capacity(16 * 1024),
            stats,
        }
    }

    /// Read a single parsed `Frame` from the underlying stream.
    ///
    /// Waits until enough data arrives to complete a frame. Data left in
    /// the read buffer after a frame is kept for the next call. Invalid
    /// frames (bad CRC, broken XML) are skipped with the error counters
    /// advanced and the read continues with the next frame.
    ///
    /// Returns `None` on a clean peer close. A close in the middle of a
    /// frame is an error.
    pub async fn read_frame(&mut self) -> crate::Result<Option<Frame>> {
        loop {
            // Drain everything parseable out of the buffer first.
            loop {
                match codec::extract(&mut self.buffer) {
                    Ok(Some(raw)) => match codec::parse(raw) {
                        Ok(frame) => return Ok(Some(frame)),
                        Err(e) => {
                            self.count_parse_error(&e);
                            warn!(error = %e, "skipping invalid frame");
                            continue;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        self.count_parse_error(&e);
                        warn!(error = %e, "resynchronising frame stream");
                        continue;
                    }
                }
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                // The remote closed the connection. For this to be a clean
                // shutdown, there should be no data left in the read
                // buffer; a partial frame means the peer died mid-send.
                return self
                    .buffer
                    .is_empty()
                    .then_some(None)
                    .ok_or_else(|| "connection reset by peer".into());
            }
        }
    }

    /// Write one complete wire frame to the socket.
    ///
    /// The bytes must already carry the `<Frame>` envelope and CRC (the
    /// codec's `build_frame`, a forwarded `Frame::raw`, or a queue
    /// entry). The buffered stream is flushed before returning so the
    /// frame hits the wire atomically.
    pub async fn write_frame(&mut self, raw: &[u8]) -> io::Result<()> {
        self.stream.write_all(raw).await?;
        self.stream.flush().await
    }

    fn count_parse_error(&self, error: &CodecError) {
        match error {
            CodecError::CrcMismatch { .. } | CodecError::MissingCrc | CodecError::InvalidCrc(_) => {
                self.stats.incr_crc_errors();
                self.stats.incr_parse_errors();
            }
            _ => self.stats.incr_parse_errors(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_frame;
    use crate::frame::{FrameClass, PollKind};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let (client, server) = pair().await;
        let mut writer = Connection::new(client, Stats::new());
        let mut reader = Connection::new(server, Stats::new());

        let raw = build_frame("<ID>1</ID><Result>IsNewSet</Result>");
        writer.write_frame(&raw).await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.class, FrameClass::Poll(PollKind::NewSet));
        assert_eq!(frame.raw, raw);
    }

    #[tokio::test]
    async fn test_invalid_frame_skipped_and_counted() {
        let (client, server) = pair().await;
        let mut writer = Connection::new(client, Stats::new());
        let stats = Stats::new();
        let mut reader = Connection::new(server, stats.clone());

        writer
            .write_frame(b"<Frame><Result>ACK</Result><CRC>00001</CRC></Frame>")
            .await
            .unwrap();
        writer
            .write_frame(&build_frame("<Result>IsNewFW</Result>"))
            .await
            .unwrap();

        // The CRC-invalid frame never surfaces; the next good frame does.
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.class, FrameClass::Poll(PollKind::NewFw));
        let snap = stats.snapshot();
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.crc_errors, 1);
    }

    #[tokio::test]
    async fn test_clean_close_yields_none() {
        let (client, server) = pair().await;
        drop(client);
        let mut reader = Connection::new(server, Stats::new());
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_junk_between_frames_tolerated() {
        let (client, server) = pair().await;
        let mut writer = Connection::new(client, Stats::new());
        let mut reader = Connection::new(server, Stats::new());

        writer.write_frame(b"noise noise").await.unwrap();
        writer.write_frame(&build_frame("<Result>END</Result>")).await.unwrap();

        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.class, FrameClass::End);
    }
}

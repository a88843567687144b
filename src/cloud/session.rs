// ABOUTME: Owns the single TCP session to the vendor cloud behind a command channel
// ABOUTME: Lazy connect, send-and-wait-ACK correlation, unsolicited frame relay

use crate::connection::Connection;
use crate::frame::{Frame, FrameClass};
use crate::stats::Stats;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

/// Observable state of the cloud session. Singleton per process; owned
/// exclusively by the session actor, read-only for everyone else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Live,
    Draining,
}

/// Result of one `send_and_wait_ack` delivery attempt.
///
/// `Acked` requires a reply whose class matches the expectations for the
/// sent class: a poll expects an echo of the same `Result` tag, anything
/// else expects a plain `ACK` envelope. A protocol-level `NACK` is its own
/// outcome - the cloud is alive and answered, it just refused the frame.
#[derive(Debug)]
pub enum SendOutcome {
    Acked(Frame),
    Nacked(Frame),
    Timeout,
    Eof,
    Io(io::ErrorKind),
}

enum Command {
    Send {
        raw: Bytes,
        class: FrameClass,
        deadline: Duration,
        resp: oneshot::Sender<SendOutcome>,
    },
    /// Fire-and-forget write: BOX-origin ACKs and END frames the cloud
    /// never replies to.
    Forward { raw: Bytes },
    /// Register the active BOX connection's relay channel. Unsolicited
    /// cloud frames go there verbatim.
    SetRelay { tx: mpsc::Sender<Frame> },
    SetDraining(bool),
}

/// Cheap cloneable handle to the session actor.
#[derive(Clone)]
pub struct CloudSession {
    tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
}

impl CloudSession {
    /// Spawn the session actor. The connection itself is created lazily on
    /// the first send; a failed connect leaves the state `Disconnected`
    /// and the next send retries.
    pub fn spawn(addr: String, connect_timeout: Duration, stats: Stats) -> CloudSession {
        let (tx, rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let actor = Actor {
            addr,
            connect_timeout,
            conn: None,
            relay: None,
            draining: false,
            state_tx,
            stats,
        };
        tokio::spawn(actor.run(rx));
        CloudSession { tx, state_rx }
    }

    /// Deliver one frame and wait for the matching acknowledgement, up to
    /// `deadline`. Never retries by itself - the mode engine owns that
    /// policy.
    pub async fn send_and_wait_ack(
        &self,
        raw: Bytes,
        class: FrameClass,
        deadline: Duration,
    ) -> SendOutcome {
        let (resp, resp_rx) = oneshot::channel();
        let cmd = Command::Send { raw, class, deadline, resp };
        if self.tx.send(cmd).await.is_err() {
            return SendOutcome::Io(io::ErrorKind::BrokenPipe);
        }
        resp_rx.await.unwrap_or(SendOutcome::Io(io::ErrorKind::BrokenPipe))
    }

    /// Write a frame the cloud never acknowledges (BOX ACKs, END).
    pub async fn forward(&self, raw: Bytes) {
        let _ = self.tx.send(Command::Forward { raw }).await;
    }

    /// Register where unsolicited cloud frames should be relayed. The
    /// previous registration (a finished BOX connection) is replaced.
    pub async fn set_relay(&self, tx: mpsc::Sender<Frame>) {
        let _ = self.tx.send(Command::SetRelay { tx }).await;
    }

    /// Mark the session as draining (replay in progress) for observers.
    pub async fn set_draining(&self, draining: bool) {
        let _ = self.tx.send(Command::SetDraining(draining)).await;
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }
}

struct Actor {
    addr: String,
    connect_timeout: Duration,
    conn: Option<Connection>,
    relay: Option<mpsc::Sender<Frame>>,
    draining: bool,
    state_tx: watch::Sender<SessionState>,
    stats: Stats,
}

enum Step {
    Cmd(Option<Command>),
    Read(crate::Result<Option<Frame>>),
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let step = match self.conn.as_mut() {
                Some(conn) => {
                    tokio::select! {
                        cmd = rx.recv() => Step::Cmd(cmd),
                        res = conn.read_frame() => Step::Read(res),
                    }
                }
                None => Step::Cmd(rx.recv().await),
            };

            match step {
                Step::Cmd(None) => break,
                Step::Cmd(Some(cmd)) => self.handle(cmd).await,
                Step::Read(res) => self.on_idle_read(res).await,
            }
        }
        debug!("cloud session actor stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Send { raw, class, deadline, resp } => {
                let outcome = self.send_and_wait(raw, &class, deadline).await;
                let _ = resp.send(outcome);
            }
            Command::Forward { raw } => {
                if let Err(e) = self.write(&raw).await {
                    debug!(error = %e, "one-way cloud write failed");
                    self.disconnect();
                }
            }
            Command::SetRelay { tx } => {
                self.relay = Some(tx);
            }
            Command::SetDraining(draining) => {
                self.draining = draining;
                if self.conn.is_some() {
                    self.publish_state();
                }
            }
        }
    }

    /// A frame arrived while no send was outstanding: forward it verbatim
    /// to the active BOX connection.
    async fn on_idle_read(&mut self, res: crate::Result<Option<Frame>>) {
        match res {
            Ok(Some(frame)) => {
                self.stats.incr_frames_from_cloud();
                self.relay_frame(frame);
            }
            Ok(None) => {
                info!("cloud closed the connection");
                self.disconnect();
            }
            Err(e) => {
                warn!(error = %e, "cloud read error");
                self.disconnect();
            }
        }
    }

    fn relay_frame(&mut self, frame: Frame) {
        if let Some(relay) = &self.relay {
            if relay.try_send(frame).is_err() {
                debug!("no BOX connection to relay cloud frame to, dropping");
            }
        } else {
            debug!("unsolicited cloud frame with no relay registered, dropping");
        }
    }

    async fn send_and_wait(
        &mut self,
        raw: Bytes,
        class: &FrameClass,
        deadline: Duration,
    ) -> SendOutcome {
        if let Err(outcome) = self.ensure_connected().await {
            return outcome;
        }

        if let Err(e) = self.write(&raw).await {
            warn!(error = %e, "cloud write failed");
            self.disconnect();
            return SendOutcome::Io(e.kind());
        }
        self.stats.incr_frames_to_cloud();

        let until = Instant::now() + deadline;
        loop {
            let conn = self.conn.as_mut().expect("connected above");
            let res = match timeout_at(until, conn.read_frame()).await {
                Ok(res) => res,
                Err(_) => return SendOutcome::Timeout,
            };
            match res {
                Ok(Some(frame)) => {
                    self.stats.incr_frames_from_cloud();
                    match reply_kind(class, &frame) {
                        ReplyKind::Ack => return SendOutcome::Acked(frame),
                        ReplyKind::Nack => return SendOutcome::Nacked(frame),
                        ReplyKind::Unrelated => {
                            // Not ours; pass it through and keep waiting.
                            self.relay_frame(frame);
                        }
                    }
                }
                Ok(None) => {
                    self.disconnect();
                    return SendOutcome::Eof;
                }
                Err(e) => {
                    warn!(error = %e, "cloud read error while awaiting ACK");
                    self.disconnect();
                    return SendOutcome::Io(io::ErrorKind::Other);
                }
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), SendOutcome> {
        if self.conn.is_some() {
            return Ok(());
        }
        self.state_tx.send_replace(SessionState::Connecting);
        debug!(addr = %self.addr, "connecting to cloud");
        match timeout(self.connect_timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(socket)) => {
                if let Err(e) = socket.set_nodelay(true) {
                    debug!(error = %e, "could not set TCP_NODELAY on cloud socket");
                }
                info!(addr = %self.addr, "cloud session established");
                self.conn = Some(Connection::new(socket, self.stats.clone()));
                self.publish_state();
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(addr = %self.addr, error = %e, "cloud connect failed");
                self.state_tx.send_replace(SessionState::Disconnected);
                Err(SendOutcome::Io(e.kind()))
            }
            Err(_) => {
                warn!(addr = %self.addr, "cloud connect timed out");
                self.state_tx.send_replace(SessionState::Disconnected);
                Err(SendOutcome::Timeout)
            }
        }
    }

    async fn write(&mut self, raw: &[u8]) -> io::Result<()> {
        if let Err(outcome) = self.ensure_connected().await {
            return Err(match outcome {
                SendOutcome::Io(kind) => io::Error::from(kind),
                _ => io::Error::from(io::ErrorKind::TimedOut),
            });
        }
        let conn = self.conn.as_mut().expect("connected above");
        conn.write_frame(raw).await
    }

    fn disconnect(&mut self) {
        self.conn = None;
        self.state_tx.send_replace(SessionState::Disconnected);
    }

    fn publish_state(&self) {
        let state = if self.draining { SessionState::Draining } else { SessionState::Live };
        self.state_tx.send_replace(state);
    }
}

enum ReplyKind {
    Ack,
    Nack,
    Unrelated,
}

/// Does `reply` acknowledge a frame of class `sent`?
///
/// Polls are echoed with the same `Result` tag; everything else gets a
/// plain `ACK`. A `NACK` always terminates the wait - the cloud answered.
fn reply_kind(sent: &FrameClass, reply: &Frame) -> ReplyKind {
    match (&reply.class, sent) {
        (FrameClass::Poll(got), FrameClass::Poll(want)) if got == want => ReplyKind::Ack,
        (FrameClass::AckFromBox, _) => ReplyKind::Ack,
        (FrameClass::Nack, _) => ReplyKind::Nack,
        _ => ReplyKind::Unrelated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::build_frame;
    use crate::frame::PollKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn parse(inner: &str) -> Frame {
        crate::codec::parse(build_frame(inner)).unwrap()
    }

    #[test]
    fn test_reply_matching_for_polls() {
        let sent = FrameClass::Poll(PollKind::NewSet);
        assert!(matches!(
            reply_kind(&sent, &parse("<Result>IsNewSet</Result>")),
            ReplyKind::Ack
        ));
        assert!(matches!(
            reply_kind(&sent, &parse("<Result>IsNewFW</Result>")),
            ReplyKind::Unrelated
        ));
        assert!(matches!(reply_kind(&sent, &parse("<Result>ACK</Result>")), ReplyKind::Ack));
        assert!(matches!(reply_kind(&sent, &parse("<Result>NACK</Result>")), ReplyKind::Nack));
    }

    #[test]
    fn test_reply_matching_for_tables() {
        let sent = FrameClass::TableData;
        assert!(matches!(reply_kind(&sent, &parse("<Result>ACK</Result>")), ReplyKind::Ack));
        assert!(matches!(
            reply_kind(&sent, &parse("<TblName>tbl_actual</TblName>")),
            ReplyKind::Unrelated
        ));
    }

    #[tokio::test]
    async fn test_send_and_wait_ack_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Fake cloud: echo polls like the real thing does.
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0);
            sock.write_all(&build_frame("<ID>2</ID><Result>IsNewSet</Result>"))
                .await
                .unwrap();
        });

        let session =
            CloudSession::spawn(addr.to_string(), Duration::from_secs(2), Stats::new());
        let outcome = session
            .send_and_wait_ack(
                build_frame("<ID>1</ID><Result>IsNewSet</Result>"),
                FrameClass::Poll(PollKind::NewSet),
                Duration::from_secs(2),
            )
            .await;

        match outcome {
            SendOutcome::Acked(frame) => {
                assert_eq!(frame.result.as_deref(), Some("IsNewSet"));
            }
            other => panic!("expected ack, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Live);
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_outcome() {
        // Bind-then-drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session =
            CloudSession::spawn(addr.to_string(), Duration::from_secs(1), Stats::new());
        let outcome = session
            .send_and_wait_ack(
                build_frame("<Result>IsNewFW</Result>"),
                FrameClass::Poll(PollKind::NewFw),
                Duration::from_secs(1),
            )
            .await;
        assert!(matches!(outcome, SendOutcome::Io(_) | SendOutcome::Timeout));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_ack_deadline_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Cloud that accepts but never replies.
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let session =
            CloudSession::spawn(addr.to_string(), Duration::from_secs(2), Stats::new());
        let outcome = session
            .send_and_wait_ack(
                build_frame("<TblName>tbl_actual</TblName>"),
                FrameClass::TableData,
                Duration::from_millis(200),
            )
            .await;
        assert!(matches!(outcome, SendOutcome::Timeout));
    }

    #[tokio::test]
    async fn test_unrelated_frames_relayed_during_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = sock.read(&mut buf).await.unwrap();
            // First an unrelated table frame, then the actual echo.
            sock.write_all(&build_frame("<TblName>tbl_events</TblName>")).await.unwrap();
            sock.write_all(&build_frame("<Result>IsNewFW</Result>")).await.unwrap();
        });

        let session =
            CloudSession::spawn(addr.to_string(), Duration::from_secs(2), Stats::new());
        let (relay_tx, mut relay_rx) = mpsc::channel(8);
        session.set_relay(relay_tx).await;

        let outcome = session
            .send_and_wait_ack(
                build_frame("<Result>IsNewFW</Result>"),
                FrameClass::Poll(PollKind::NewFw),
                Duration::from_secs(2),
            )
            .await;
        assert!(matches!(outcome, SendOutcome::Acked(_)));

        let relayed = relay_rx.recv().await.unwrap();
        assert_eq!(relayed.tbl_name.as_deref(), Some("tbl_events"));
    }
}

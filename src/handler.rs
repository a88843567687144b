// ABOUTME: Per-BOX-connection handler - reads frames, applies the mode engine, writes replies
// ABOUTME: Fans parsed frames to the observation sink and injects pending settings on poll carriers

use crate::cloud::{CloudSession, SendOutcome};
use crate::connection::Connection;
use crate::control::ControlPipeline;
use crate::frame::{Frame, FrameClass};
use crate::mode::{Action, ModeEngine};
use crate::publish::{Direction, Event, FrameEvent, FrameSink};
use crate::queue::{self, DurableQueue};
use crate::shutdown::Shutdown;
use crate::stats::Stats;
use crate::synth::Synthesiser;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Handles one accepted BOX connection until the BOX hangs up or the
/// supervisor shuts down.
///
/// The handler owns the socket exclusively. Every response is a complete
/// frame written in one call, so partial frames never interleave on the
/// BOX side. Cloud-side trouble never closes this socket; only the BOX
/// closing its end (or shutdown) ends the loop.
pub struct Handler {
    pub(crate) connection: Connection,
    pub(crate) engine: Arc<ModeEngine>,
    pub(crate) queue: Arc<DurableQueue>,
    pub(crate) cloud: CloudSession,
    pub(crate) synth: Synthesiser,
    pub(crate) control: Arc<ControlPipeline>,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) stats: Stats,
    pub(crate) shutdown: Shutdown,
    /// Unsolicited cloud frames for this connection, registered with the
    /// cloud session at accept time.
    pub(crate) relay_rx: mpsc::Receiver<Frame>,
    /// Set once the relay is gone (a newer connection took it over);
    /// stops the select arm from spinning on a closed channel.
    pub(crate) relay_closed: bool,
}

enum Step {
    Box(Option<Frame>),
    Relay(Option<Frame>),
    Shutdown,
}

impl Handler {
    pub async fn run(&mut self) -> crate::Result<()> {
        while !self.shutdown.is_shutdown() {
            let step = tokio::select! {
                res = self.connection.read_frame() => Step::Box(res?),
                frame = self.relay_rx.recv(), if !self.relay_closed => Step::Relay(frame),
                _ = self.shutdown.recv() => Step::Shutdown,
            };

            match step {
                Step::Box(Some(frame)) => self.handle_frame(frame).await?,
                Step::Box(None) => {
                    info!("BOX closed the connection");
                    return Ok(());
                }
                Step::Relay(Some(frame)) => {
                    // Cloud-origin frame not tied to any send: pass it to
                    // the BOX verbatim.
                    self.sink
                        .publish(Event::Frame(FrameEvent::from_frame(Direction::FromCloud, &frame)));
                    self.write_to_box(&frame.raw).await?;
                }
                Step::Relay(None) => {
                    // A newer BOX connection took the relay over, or the
                    // cloud actor is gone. Either way, stop polling it.
                    debug!("relay channel closed");
                    self.relay_closed = true;
                }
                Step::Shutdown => break,
            }
        }
        Ok(())
    }

    /// Per-frame protocol: publish, inject or route, respond.
    async fn handle_frame(&mut self, frame: Frame) -> crate::Result<()> {
        let received = Instant::now();
        self.stats.incr_frames_from_box();
        debug!(class = %frame.class, "frame from BOX");

        self.sink
            .publish(Event::Frame(FrameEvent::from_frame(Direction::FromBox, &frame)));

        // Setting ACK/NACK tracking sees every frame, before routing.
        self.control.observe_frame(&frame);

        // A poll is a carrier opportunity: a queued setting takes the
        // place of the echo, exactly like the cloud injects its own.
        if matches!(frame.class, FrameClass::Poll(_)) {
            if let Some(setting) = self.control.take_for_injection() {
                self.respond(&setting, received, &frame.class).await?;
                return Ok(());
            }
        }

        match self.engine.decide(&frame.class) {
            Action::Forward { fallback } => {
                let outcome = self
                    .cloud
                    .send_and_wait_ack(frame.raw.clone(), frame.class.clone(), fallback)
                    .await;
                match &outcome {
                    SendOutcome::Acked(reply) | SendOutcome::Nacked(reply) => {
                        self.engine.note_forward_ok();
                        self.sink.publish(Event::Frame(FrameEvent::from_frame(
                            Direction::FromCloud,
                            reply,
                        )));
                        // Cloud replies are relayed byte-for-byte, on the
                        // cloud's own timing - no floor applies.
                        self.write_to_box(&reply.raw).await?;
                    }
                    SendOutcome::Timeout | SendOutcome::Eof | SendOutcome::Io(_) => {
                        debug!(outcome = ?outcome, "cloud fallback, answering locally");
                        self.stats.incr_cloud_fallbacks();
                        self.engine.note_fallback();
                        self.answer_locally(&frame, received, frame.class.queue_eligible())
                            .await?;
                    }
                }
            }
            Action::ForwardOneWay => {
                self.cloud.forward(frame.raw.clone()).await;
            }
            Action::Local { enqueue } => {
                self.answer_locally(&frame, received, enqueue).await?;
                self.engine.maybe_hybrid_probe(&frame);
            }
        }

        Ok(())
    }

    /// Buffer the frame for later cloud delivery (when eligible) and send
    /// the synthesised response, honouring the class timing floor.
    async fn answer_locally(
        &mut self,
        frame: &Frame,
        received: Instant,
        enqueue: bool,
    ) -> crate::Result<()> {
        if enqueue {
            match self.queue.enqueue(&frame.raw, frame.class.clone(), queue::now_ms()) {
                Ok(id) => debug!(id, size = self.queue.size(), "frame enqueued"),
                Err(e) => warn!(error = %e, "enqueue failed, frame not buffered"),
            }
        }

        if let Some(reply) = self.synth.respond(frame) {
            self.stats.incr_local_acks();
            self.respond(&reply, received, &frame.class).await?;
        }
        Ok(())
    }

    /// Write a locally generated frame, not earlier than the class floor
    /// after the triggering frame arrived. Real cloud replies are never
    /// instantaneous and the BOX has seen enough of them to know.
    async fn respond(
        &mut self,
        raw: &[u8],
        received: Instant,
        class: &FrameClass,
    ) -> crate::Result<()> {
        let floor = received + Synthesiser::response_floor(class);
        tokio::time::sleep_until(floor).await;
        self.write_to_box(raw).await
    }

    async fn write_to_box(&mut self, raw: &[u8]) -> crate::Result<()> {
        self.connection.write_frame(raw).await?;
        self.stats.incr_frames_to_box();
        Ok(())
    }
}

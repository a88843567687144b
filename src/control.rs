// ABOUTME: Control pipeline - materialises "set TBL.ITEM = VALUE" requests as setting frames
// ABOUTME: Single pending slot, carrier injection on polls, ACK/NACK/expiry tracking

use crate::codec::build_frame;
use crate::frame::Frame;
use crate::publish::{ControlRequest, ControlStatus, ControlUpdate, Event, FrameSink};
use crate::shutdown::Shutdown;
use crate::stats::Stats;
use crate::synth::IdGen;
use bytes::Bytes;
use chrono::{Local, Utc};
use quick_xml::escape::escape;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ControlError {
    /// A request is already pending and backlogging is disabled.
    #[error("another setting is pending")]
    Busy,
}

/// Lifecycle of the pending setting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingState {
    Queued,
    Sent,
    Acked,
    Failed,
    Expired,
}

/// The single in-flight control command. At most one exists per BOX.
#[derive(Debug)]
struct Pending {
    request: ControlRequest,
    frame: Bytes,
    state: SettingState,
    deadline: Option<Instant>,
    retries: u32,
}

impl Pending {
    fn is_terminal(&self) -> bool {
        matches!(self.state, SettingState::Acked | SettingState::Failed)
    }
}

#[derive(Default)]
struct Inner {
    pending: Option<Pending>,
    backlog: VecDeque<ControlRequest>,
}

/// Accepts high-level setting requests and shepherds them onto a live BOX
/// session.
///
/// Delivery rides a carrier: the next inbound poll is answered with the
/// setting frame instead of the synthesised echo, which is exactly how
/// the real cloud injects settings. Between the send and the BOX's
/// `ACK`/`Reason=Setting`, polls are answered normally again.
pub struct ControlPipeline {
    inner: Mutex<Inner>,
    ids: Arc<IdGen>,
    sink: Arc<dyn FrameSink>,
    updates: mpsc::Sender<ControlUpdate>,
    stats: Stats,
    deadline: Duration,
    retry_max: u32,
    backlog_allowed: bool,
}

impl ControlPipeline {
    pub fn new(
        ids: Arc<IdGen>,
        sink: Arc<dyn FrameSink>,
        updates: mpsc::Sender<ControlUpdate>,
        stats: Stats,
        deadline: Duration,
        retry_max: u32,
        backlog_allowed: bool,
    ) -> Arc<ControlPipeline> {
        Arc::new(ControlPipeline {
            inner: Mutex::new(Inner::default()),
            ids,
            sink,
            updates,
            stats,
            deadline,
            retry_max,
            backlog_allowed,
        })
    }

    /// Accept a new request. If a non-terminal request is already pending
    /// the new one is either backlogged or rejected, per configuration.
    pub fn submit(&self, request: ControlRequest) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().expect("control lock poisoned");

        let busy = inner.pending.as_ref().is_some_and(|p| !p.is_terminal());
        if busy {
            if !self.backlog_allowed {
                warn!(id = %request.correlation_id, "setting slot busy, rejecting request");
                return Err(ControlError::Busy);
            }
            debug!(id = %request.correlation_id, "setting slot busy, backlogging request");
            self.report(&request, ControlStatus::Queued, None);
            inner.backlog.push_back(request);
            return Ok(());
        }

        self.install(&mut inner, request);
        Ok(())
    }

    fn install(&self, inner: &mut Inner, request: ControlRequest) {
        info!(
            id = %request.correlation_id,
            tbl = %request.tbl_name,
            item = %request.tbl_item,
            value = %request.new_value,
            "setting request queued"
        );
        let frame = build_setting_frame(&request, &self.ids);
        self.report(&request, ControlStatus::Queued, None);
        inner.pending = Some(Pending {
            request,
            frame,
            state: SettingState::Queued,
            deadline: None,
            retries: 0,
        });
    }

    /// Called by the connection handler when a poll arrives: if a setting
    /// is waiting, claim the poll as its carrier. Marks the slot sent and
    /// arms the acknowledgement deadline.
    pub fn take_for_injection(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("control lock poisoned");
        let pending = inner.pending.as_mut()?;
        if pending.state != SettingState::Queued {
            return None;
        }
        pending.state = SettingState::Sent;
        pending.deadline = Some(Instant::now() + self.deadline);
        info!(id = %pending.request.correlation_id, "setting frame riding poll carrier");
        Some(pending.frame.clone())
    }

    /// Feed every inbound BOX frame through here. A bare ACK does not
    /// clear the slot; only `ACK` with `Reason=Setting` does. An explicit
    /// `NACK` with `Reason=Setting` fails the slot immediately, no
    /// retries.
    pub fn observe_frame(&self, frame: &Frame) {
        let mut inner = self.inner.lock().expect("control lock poisoned");
        let Some(pending) = inner.pending.as_mut() else {
            return;
        };
        if pending.state != SettingState::Sent {
            return;
        }

        if frame.is_setting_ack() {
            pending.state = SettingState::Acked;
            pending.deadline = None;
            self.stats.incr_settings_acked();
            info!(id = %pending.request.correlation_id, "setting acknowledged by BOX");
            let request = pending.request.clone();
            self.report(&request, ControlStatus::Acked, None);
            self.promote_backlog(&mut inner);
        } else if frame.is_setting_nack() {
            let reason = frame
                .new_value
                .clone()
                .unwrap_or_else(|| "NACK".to_string());
            pending.state = SettingState::Failed;
            pending.deadline = None;
            self.stats.incr_settings_failed();
            warn!(
                id = %pending.request.correlation_id,
                reason = %reason,
                "setting refused by BOX"
            );
            let request = pending.request.clone();
            self.report(&request, ControlStatus::Failed, Some(reason));
            self.promote_backlog(&mut inner);
        }
    }

    /// Deadline sweep. On expiry the slot retries with a completely fresh
    /// envelope - a repeated envelope correlates with BOX-side refusal in
    /// captures - until the retry budget runs out.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().expect("control lock poisoned");
        let Some(pending) = inner.pending.as_mut() else {
            return;
        };
        if pending.state != SettingState::Sent {
            return;
        }
        let Some(deadline) = pending.deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }

        pending.state = SettingState::Expired;
        pending.deadline = None;
        self.stats.incr_settings_expired();
        let request = pending.request.clone();
        self.report(&request, ControlStatus::Expired, None);

        if pending.retries < self.retry_max {
            pending.retries += 1;
            pending.frame = build_setting_frame(&pending.request, &self.ids);
            pending.state = SettingState::Queued;
            pending.deadline = None;
            warn!(
                id = %request.correlation_id,
                retry = pending.retries,
                "setting expired, retrying with fresh envelope"
            );
        } else {
            pending.state = SettingState::Failed;
            pending.deadline = None;
            self.stats.incr_settings_failed();
            warn!(id = %request.correlation_id, "setting retries exhausted");
            self.report(&request, ControlStatus::Failed, Some("retries exhausted".to_string()));
            self.promote_backlog(&mut inner);
        }
    }

    /// Current slot state, for observability.
    pub fn pending_state(&self) -> Option<(ControlRequest, SettingState)> {
        let inner = self.inner.lock().expect("control lock poisoned");
        inner
            .pending
            .as_ref()
            .map(|p| (p.request.clone(), p.state))
    }

    /// Periodic deadline sweeping until shutdown.
    pub async fn run_timer(self: Arc<Self>, mut shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        while !shutdown.is_shutdown() {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                _ = shutdown.recv() => break,
            }
        }
    }

    fn promote_backlog(&self, inner: &mut Inner) {
        if let Some(next) = inner.backlog.pop_front() {
            self.install(inner, next);
        }
    }

    fn report(&self, request: &ControlRequest, status: ControlStatus, reason: Option<String>) {
        let update = ControlUpdate {
            correlation_id: request.correlation_id.clone(),
            status,
            reason,
        };
        if self.updates.try_send(update.clone()).is_err() {
            debug!("control update channel full, dropping update");
        }
        self.sink.publish(Event::Control(update));
    }
}

/// Build the outbound setting frame. Every call generates fresh `ID` and
/// `ID_Set` values, `DT` in the protocol's local wall-clock format and
/// `TSec` in UTC seconds.
fn build_setting_frame(request: &ControlRequest, ids: &IdGen) -> Bytes {
    let dt = Local::now().format("%Y-%m-%d %H:%M:%S");
    let tsec = Utc::now().timestamp();
    let inner = format!(
        "<ID>{id}</ID><ID_Set>{id_set}</ID_Set><Reason>Setting</Reason>\
         <TblName>{tbl}</TblName><TblItem>{item}</TblItem><NewValue>{value}</NewValue>\
         <DT>{dt}</DT><TSec>{tsec}</TSec>",
        id = ids.next(),
        id_set = ids.next(),
        tbl = escape(request.tbl_name.as_str()),
        item = escape(request.tbl_item.as_str()),
        value = escape(request.new_value.as_str()),
    );
    build_frame(&inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::frame::FrameClass;
    use crate::publish::NullSink;

    fn request(id: &str) -> ControlRequest {
        ControlRequest {
            correlation_id: id.to_string(),
            tbl_name: "tbl_box_prms".to_string(),
            tbl_item: "MODE".to_string(),
            new_value: "0".to_string(),
        }
    }

    fn pipeline(
        backlog: bool,
        retry_max: u32,
    ) -> (Arc<ControlPipeline>, mpsc::Receiver<ControlUpdate>) {
        let (tx, rx) = mpsc::channel(32);
        let pipeline = ControlPipeline::new(
            IdGen::new(),
            Arc::new(NullSink),
            tx,
            Stats::new(),
            Duration::from_secs(30),
            retry_max,
            backlog,
        );
        (pipeline, rx)
    }

    fn box_frame(inner: &str) -> Frame {
        codec::parse(build_frame(inner)).unwrap()
    }

    #[tokio::test]
    async fn test_setting_frame_is_valid_and_complete() {
        let ids = IdGen::new();
        let raw = build_setting_frame(&request("r1"), &ids);
        let frame = codec::parse(raw).unwrap();

        assert_eq!(frame.class, FrameClass::Setting);
        assert_eq!(frame.reason.as_deref(), Some("Setting"));
        assert_eq!(frame.tbl_name.as_deref(), Some("tbl_box_prms"));
        assert_eq!(frame.tbl_item.as_deref(), Some("MODE"));
        assert_eq!(frame.new_value.as_deref(), Some("0"));
        assert!(frame.id.is_some());
        assert!(frame.id_set.is_some());
        assert!(frame.dt.is_some());
    }

    #[tokio::test]
    async fn test_envelope_never_repeats() {
        let ids = IdGen::new();
        let req = request("r1");
        let a = codec::parse(build_setting_frame(&req, &ids)).unwrap();
        let b = codec::parse(build_setting_frame(&req, &ids)).unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.id_set, b.id_set);
    }

    #[tokio::test]
    async fn test_injection_lifecycle_to_acked() {
        let (pipeline, mut rx) = pipeline(false, 3);
        pipeline.submit(request("r1")).unwrap();
        assert_eq!(rx.recv().await.unwrap().status, ControlStatus::Queued);
        assert_eq!(
            pipeline.pending_state().unwrap().1,
            SettingState::Queued
        );

        let injected = pipeline.take_for_injection().expect("setting rides carrier");
        assert_eq!(codec::parse(injected).unwrap().class, FrameClass::Setting);
        assert_eq!(pipeline.pending_state().unwrap().1, SettingState::Sent);

        // Next poll is answered normally: nothing more to inject.
        assert!(pipeline.take_for_injection().is_none());

        // A bare ACK does not clear the slot.
        pipeline.observe_frame(&box_frame("<Result>ACK</Result>"));
        assert_eq!(pipeline.pending_state().unwrap().1, SettingState::Sent);

        pipeline.observe_frame(&box_frame("<Result>ACK</Result><Reason>Setting</Reason>"));
        assert_eq!(pipeline.pending_state().unwrap().1, SettingState::Acked);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, ControlStatus::Acked);
        assert_eq!(update.correlation_id, "r1");
    }

    #[tokio::test]
    async fn test_nack_fails_without_retry() {
        let (pipeline, mut rx) = pipeline(false, 3);
        pipeline.submit(request("r1")).unwrap();
        rx.recv().await.unwrap();
        pipeline.take_for_injection().unwrap();

        pipeline.observe_frame(&box_frame(
            "<Result>NACK</Result><Reason>Setting</Reason><NewValue>E42</NewValue>",
        ));
        assert_eq!(pipeline.pending_state().unwrap().1, SettingState::Failed);
        let update = rx.recv().await.unwrap();
        assert_eq!(update.status, ControlStatus::Failed);
        assert_eq!(update.reason.as_deref(), Some("E42"));

        // NACK is terminal; no re-injection happens.
        assert!(pipeline.take_for_injection().is_none());
    }

    #[tokio::test]
    async fn test_busy_slot_rejected_without_backlog() {
        let (pipeline, _rx) = pipeline(false, 3);
        pipeline.submit(request("r1")).unwrap();
        assert!(matches!(pipeline.submit(request("r2")), Err(ControlError::Busy)));
    }

    #[tokio::test]
    async fn test_backlog_promotes_after_terminal() {
        let (pipeline, _rx) = pipeline(true, 3);
        pipeline.submit(request("r1")).unwrap();
        pipeline.submit(request("r2")).unwrap();

        pipeline.take_for_injection().unwrap();
        pipeline.observe_frame(&box_frame("<Result>ACK</Result><Reason>Setting</Reason>"));

        // r2 took the slot.
        let (req, state) = pipeline.pending_state().unwrap();
        assert_eq!(req.correlation_id, "r2");
        assert_eq!(state, SettingState::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_retries_then_fails() {
        let (tx, mut rx) = mpsc::channel(32);
        let pipeline = ControlPipeline::new(
            IdGen::new(),
            Arc::new(NullSink),
            tx,
            Stats::new(),
            Duration::from_secs(30),
            1,
            false,
        );
        pipeline.submit(request("r1")).unwrap();
        assert_eq!(rx.recv().await.unwrap().status, ControlStatus::Queued);

        let first = pipeline.take_for_injection().unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;
        pipeline.tick();
        assert_eq!(rx.recv().await.unwrap().status, ControlStatus::Expired);
        assert_eq!(pipeline.pending_state().unwrap().1, SettingState::Queued);

        // Retry carries a fresh envelope.
        let second = pipeline.take_for_injection().unwrap();
        assert_ne!(first, second);

        tokio::time::advance(Duration::from_secs(31)).await;
        pipeline.tick();
        assert_eq!(rx.recv().await.unwrap().status, ControlStatus::Expired);
        assert_eq!(rx.recv().await.unwrap().status, ControlStatus::Failed);
        assert_eq!(pipeline.pending_state().unwrap().1, SettingState::Failed);
    }

    #[tokio::test]
    async fn test_observe_ignores_frames_when_nothing_sent() {
        let (pipeline, _rx) = pipeline(false, 3);
        // No pending at all: must not panic or change anything.
        pipeline.observe_frame(&box_frame("<Result>ACK</Result><Reason>Setting</Reason>"));
        assert!(pipeline.pending_state().is_none());
    }
}

// ABOUTME: Durable bounded FIFO of BOX-origin frames awaiting cloud delivery
// ABOUTME: JSONL operation log on disk, replayed at startup, compacted when it grows

use crate::frame::FrameClass;
use crate::stats::Stats;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Back-off base for repeated delivery failures.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Back-off ceiling; beyond this the schedule stays flat.
const BACKOFF_CAP: Duration = Duration::from_secs(60);
/// Operations appended since the last compaction before the log is
/// rewritten in place.
const COMPACT_THRESHOLD: usize = 4096;

/// Milliseconds since the UNIX epoch; the queue's notion of "now" is
/// always passed in so tests can steer the clock.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue record encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One durable record: a raw frame plus the metadata retry scheduling
/// needs. Ordered by (enqueue timestamp, sequence id); FIFO by
/// construction.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub id: u64,
    pub enqueued_at_ms: u64,
    pub not_before_ms: u64,
    pub retries: u32,
    pub class: FrameClass,
    pub frame: String,
}

impl Entry {
    pub fn frame_bytes(&self) -> bytes::Bytes {
        bytes::Bytes::from(self.frame.clone().into_bytes())
    }
}

/// Result of deferring a failed delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeferOutcome {
    /// Entry stays queued; next attempt not before the given time.
    Deferred { not_before_ms: u64, retries: u32 },
    /// Entry hit the retry ceiling and was dropped.
    Exhausted,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
    Push { entry: Entry },
    Pop { id: u64, reason: String },
    Defer { id: u64, not_before_ms: u64, retries: u32 },
}

struct Inner {
    entries: VecDeque<Entry>,
    next_id: u64,
    log: File,
    ops_since_compact: usize,
}

/// Bounded, ordered, disk-backed buffer of frames awaiting cloud delivery.
///
/// All operations are internally serialised behind one mutex; the log
/// append happens inside the critical section so the on-disk order always
/// matches the in-memory order. On overflow the oldest entry is dropped
/// (counted) - newest data wins, matching what the cloud would rather see
/// after a long outage.
pub struct DurableQueue {
    inner: Mutex<Inner>,
    path: PathBuf,
    max: usize,
    retry_ceiling: u32,
    stats: Stats,
}

impl DurableQueue {
    /// Open (or create) the queue at `path`, replaying any existing log.
    /// Entries keep their original enqueue timestamps across restarts. A
    /// corrupt tail record truncates the rest of the log with a warning;
    /// everything before it survives.
    pub fn open(
        path: &Path,
        max: usize,
        retry_ceiling: u32,
        stats: Stats,
    ) -> Result<DurableQueue, QueueError> {
        let (entries, next_id) = replay_log(path)?;
        if !entries.is_empty() {
            info!(entries = entries.len(), "rehydrated durable queue");
        }

        // Compact on load so the log starts as a clean snapshot.
        write_snapshot(path, &entries)?;
        let log = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(DurableQueue {
            inner: Mutex::new(Inner { entries, next_id, log, ops_since_compact: 0 }),
            path: path.to_path_buf(),
            max,
            retry_ceiling,
            stats,
        })
    }

    /// Append a frame. On saturation the oldest entry is evicted first
    /// (reason `overflow`, counted). Returns the new entry's sequence id.
    pub fn enqueue(
        &self,
        frame: &[u8],
        class: FrameClass,
        now_ms: u64,
    ) -> Result<u64, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");

        if inner.entries.len() >= self.max {
            if let Some(oldest) = inner.entries.pop_front() {
                self.stats.incr_queue_overflow();
                warn!(id = oldest.id, "queue saturated, dropping oldest entry");
                append_record(
                    &mut inner,
                    &LogRecord::Pop { id: oldest.id, reason: "overflow".to_string() },
                )?;
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let entry = Entry {
            id,
            enqueued_at_ms: now_ms,
            not_before_ms: now_ms,
            retries: 0,
            class,
            frame: String::from_utf8_lossy(frame).into_owned(),
        };
        append_record(&mut inner, &LogRecord::Push { entry: entry.clone() })?;
        inner.entries.push_back(entry);
        self.maybe_compact(&mut inner)?;
        Ok(id)
    }

    /// The head entry, if it is ready for delivery. Only the head is ever
    /// offered - a backed-off head blocks everything behind it, which is
    /// exactly the no-reorder guarantee the cloud's in-order view needs.
    pub fn peek_next(&self, now_ms: u64) -> Option<Entry> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .entries
            .front()
            .filter(|e| e.not_before_ms <= now_ms)
            .cloned()
    }

    /// When the head becomes deliverable, if any entry exists.
    pub fn next_not_before(&self) -> Option<u64> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.entries.front().map(|e| e.not_before_ms)
    }

    /// Remove an entry after positive cloud delivery.
    pub fn mark_sent(&self, id: u64) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(pos) = inner.entries.iter().position(|e| e.id == id) {
            inner.entries.remove(pos);
            self.stats.incr_queue_replayed();
            append_record(&mut inner, &LogRecord::Pop { id, reason: "sent".to_string() })?;
            self.maybe_compact(&mut inner)?;
        }
        Ok(())
    }

    /// Push an entry's next attempt into the future after a failed
    /// delivery. The schedule is exponential from 1 s, capped at 60 s; an
    /// entry past the retry ceiling is dropped with reason `exhausted`.
    pub fn defer(&self, id: u64, now_ms: u64) -> Result<DeferOutcome, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some(pos) = inner.entries.iter().position(|e| e.id == id) else {
            return Ok(DeferOutcome::Exhausted);
        };

        let retries = inner.entries[pos].retries + 1;
        if retries > self.retry_ceiling {
            inner.entries.remove(pos);
            self.stats.incr_queue_exhausted();
            warn!(id, retries, "entry exhausted its retries, dropping");
            append_record(&mut inner, &LogRecord::Pop { id, reason: "exhausted".to_string() })?;
            self.maybe_compact(&mut inner)?;
            return Ok(DeferOutcome::Exhausted);
        }

        let backoff = backoff_for(retries);
        let not_before_ms = now_ms + backoff.as_millis() as u64;
        {
            let entry = &mut inner.entries[pos];
            entry.retries = retries;
            entry.not_before_ms = not_before_ms;
        }
        debug!(id, retries, backoff_ms = backoff.as_millis() as u64, "delivery deferred");
        append_record(&mut inner, &LogRecord::Defer { id, not_before_ms, retries })?;
        Ok(DeferOutcome::Deferred { not_before_ms, retries })
    }

    /// Remove an entry for a caller-supplied reason (logged; used for
    /// cloud-refused entries and operator intervention).
    pub fn drop_entry(&self, id: u64, reason: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if let Some(pos) = inner.entries.iter().position(|e| e.id == id) {
            inner.entries.remove(pos);
            warn!(id, reason, "queue entry dropped");
            append_record(&mut inner, &LogRecord::Pop { id, reason: reason.to_string() })?;
            self.maybe_compact(&mut inner)?;
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Age of the oldest entry, for observability.
    pub fn oldest_age(&self, now_ms: u64) -> Option<Duration> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .entries
            .front()
            .map(|e| Duration::from_millis(now_ms.saturating_sub(e.enqueued_at_ms)))
    }

    /// Force the log to disk. Called once on shutdown.
    pub fn flush(&self) -> Result<(), QueueError> {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.log.sync_all()?;
        Ok(())
    }

    fn maybe_compact(&self, inner: &mut Inner) -> Result<(), QueueError> {
        if inner.ops_since_compact < COMPACT_THRESHOLD {
            return Ok(());
        }
        debug!(entries = inner.entries.len(), "compacting queue log");
        write_snapshot(&self.path, &inner.entries)?;
        inner.log = OpenOptions::new().append(true).open(&self.path)?;
        inner.ops_since_compact = 0;
        Ok(())
    }
}

fn backoff_for(retries: u32) -> Duration {
    let factor = 1u64 << retries.saturating_sub(1).min(6);
    BACKOFF_CAP.min(BACKOFF_BASE * factor as u32)
}

fn append_record(inner: &mut Inner, record: &LogRecord) -> Result<(), QueueError> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    inner.log.write_all(line.as_bytes())?;
    inner.ops_since_compact += 1;
    Ok(())
}

/// Replay the operation log into the live entry list. Stops at the first
/// corrupt record and keeps everything before it; the caller rewrites a
/// clean snapshot right after.
fn replay_log(path: &Path) -> Result<(VecDeque<Entry>, u64), QueueError> {
    let mut entries: VecDeque<Entry> = VecDeque::new();
    let mut next_id = 1u64;

    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((entries, next_id)),
        Err(e) => return Err(e.into()),
    };

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    line = lineno + 1,
                    error = %e,
                    "corrupt queue log record, truncating the rest of the log"
                );
                break;
            }
        };
        match record {
            LogRecord::Push { entry } => {
                next_id = next_id.max(entry.id + 1);
                entries.push_back(entry);
            }
            LogRecord::Pop { id, .. } => {
                if let Some(pos) = entries.iter().position(|e| e.id == id) {
                    entries.remove(pos);
                }
            }
            LogRecord::Defer { id, not_before_ms, retries } => {
                if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                    entry.not_before_ms = not_before_ms;
                    entry.retries = retries;
                }
            }
        }
    }

    Ok((entries, next_id))
}

/// Rewrite the log as a clean snapshot of push records, atomically via a
/// temp file rename.
fn write_snapshot(path: &Path, entries: &VecDeque<Entry>) -> Result<(), QueueError> {
    let tmp = path.with_extension("tmp");
    {
        let mut out = File::create(&tmp)?;
        for entry in entries {
            let mut line = serde_json::to_string(&LogRecord::Push { entry: entry.clone() })?;
            line.push('\n');
            out.write_all(line.as_bytes())?;
        }
        out.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PollKind;
    use std::io::Write as _;

    fn test_queue(dir: &tempfile::TempDir, max: usize, ceiling: u32) -> DurableQueue {
        DurableQueue::open(&dir.path().join("queue.jsonl"), max, ceiling, Stats::new()).unwrap()
    }

    #[test]
    fn test_enqueue_assigns_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir, 10, 3);
        let a = queue.enqueue(b"<Frame>a</Frame>", FrameClass::TableData, 1000).unwrap();
        let b = queue.enqueue(b"<Frame>b</Frame>", FrameClass::TableData, 1001).unwrap();
        assert!(b > a);
        assert_eq!(queue.size(), 2);
    }

    #[test]
    fn test_fifo_head_only_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir, 10, 3);
        let a = queue.enqueue(b"a", FrameClass::TableData, 1000).unwrap();
        queue.enqueue(b"b", FrameClass::TableData, 1001).unwrap();

        let head = queue.peek_next(2000).unwrap();
        assert_eq!(head.id, a);
        assert_eq!(head.frame, "a");

        // Backed-off head blocks the entry behind it.
        queue.defer(a, 2000).unwrap();
        assert!(queue.peek_next(2000).is_none());
        assert!(queue.peek_next(2000 + 1001).is_some());
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Stats::new();
        let queue =
            DurableQueue::open(&dir.path().join("q.jsonl"), 3, 3, stats.clone()).unwrap();

        let first = queue.enqueue(b"1", FrameClass::TableData, 1).unwrap();
        queue.enqueue(b"2", FrameClass::TableData, 2).unwrap();
        queue.enqueue(b"3", FrameClass::TableData, 3).unwrap();
        queue.enqueue(b"4", FrameClass::TableData, 4).unwrap();

        assert_eq!(queue.size(), 3);
        assert_eq!(stats.snapshot().queue_overflow, 1);
        let head = queue.peek_next(10).unwrap();
        assert_ne!(head.id, first);
        assert_eq!(head.frame, "2");
    }

    #[test]
    fn test_mark_sent_removes_head() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir, 10, 3);
        let a = queue.enqueue(b"a", FrameClass::Poll(PollKind::NewSet), 1).unwrap();
        queue.enqueue(b"b", FrameClass::TableData, 2).unwrap();

        queue.mark_sent(a).unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.peek_next(10).unwrap().frame, "b");
    }

    #[test]
    fn test_defer_backoff_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir, 10, 10);
        let id = queue.enqueue(b"a", FrameClass::TableData, 0).unwrap();

        match queue.defer(id, 0).unwrap() {
            DeferOutcome::Deferred { not_before_ms, retries } => {
                assert_eq!(retries, 1);
                assert_eq!(not_before_ms, 1000);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        match queue.defer(id, 0).unwrap() {
            DeferOutcome::Deferred { not_before_ms, retries } => {
                assert_eq!(retries, 2);
                assert_eq!(not_before_ms, 2000);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_backoff_caps_at_sixty_seconds() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(2));
        assert_eq!(backoff_for(6), Duration::from_secs(32));
        assert_eq!(backoff_for(7), Duration::from_secs(60));
        assert_eq!(backoff_for(40), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_ceiling_exhausts_entry() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Stats::new();
        let queue =
            DurableQueue::open(&dir.path().join("q.jsonl"), 10, 2, stats.clone()).unwrap();
        let id = queue.enqueue(b"a", FrameClass::TableData, 0).unwrap();

        assert!(matches!(queue.defer(id, 0).unwrap(), DeferOutcome::Deferred { .. }));
        assert!(matches!(queue.defer(id, 0).unwrap(), DeferOutcome::Deferred { .. }));
        assert_eq!(queue.defer(id, 0).unwrap(), DeferOutcome::Exhausted);
        assert!(queue.is_empty());
        assert_eq!(stats.snapshot().queue_exhausted, 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");

        {
            let queue = DurableQueue::open(&path, 10, 3, Stats::new()).unwrap();
            queue.enqueue(b"first", FrameClass::TableData, 111).unwrap();
            let gone = queue.enqueue(b"second", FrameClass::TableData, 222).unwrap();
            queue.enqueue(b"third", FrameClass::Poll(PollKind::NewFw), 333).unwrap();
            queue.mark_sent(queue.peek_next(999).unwrap().id).unwrap();
            queue.drop_entry(gone, "test").unwrap();
            queue.flush().unwrap();
        }

        let queue = DurableQueue::open(&path, 10, 3, Stats::new()).unwrap();
        assert_eq!(queue.size(), 1);
        let survivor = queue.peek_next(u64::MAX).unwrap();
        assert_eq!(survivor.frame, "third");
        // Original enqueue timestamp is preserved for age-based decisions.
        assert_eq!(survivor.enqueued_at_ms, 333);
    }

    #[test]
    fn test_corrupt_tail_truncates_not_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("q.jsonl");

        {
            let queue = DurableQueue::open(&path, 10, 3, Stats::new()).unwrap();
            queue.enqueue(b"good", FrameClass::TableData, 1).unwrap();
            queue.flush().unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{\"op\":\"push\",\"entry\":{TRUNCATED").unwrap();
        }

        let queue = DurableQueue::open(&path, 10, 3, Stats::new()).unwrap();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.peek_next(10).unwrap().frame, "good");
    }

    #[test]
    fn test_oldest_age() {
        let dir = tempfile::tempdir().unwrap();
        let queue = test_queue(&dir, 10, 3);
        assert!(queue.oldest_age(5000).is_none());
        queue.enqueue(b"a", FrameClass::TableData, 2000).unwrap();
        assert_eq!(queue.oldest_age(5000), Some(Duration::from_millis(3000)));
    }
}

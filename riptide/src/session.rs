//! Per-partition stream bookkeeping and the session that owns it. A
//! `PartitionState` outlives any individual stream or channel: it carries the
//! resume point (seqnos, snapshot window, vbucket uuid, failover log) across
//! reconnects, reroutes and rollbacks.

use crate::error::{DcpError, DcpResult};
use brine::message::{FailoverEntry, StreamEndReason, StreamRequest};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Whether a data message moved the stream forward or finished it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StreamProgress {
    Continue,
    /// The message carried the requested end seqno; the stream is done.
    Completed,
}

struct Inner {
    state: StreamState,
    start_seqno: u64,
    end_seqno: u64,
    snapshot_start: u64,
    snapshot_end: u64,
    vbucket_uuid: u64,
    failover_log: Vec<FailoverEntry>,
    current_seqno: u64,
    pending_failover: bool,
    pending_seqno: bool,
    end_reason: Option<StreamEndReason>,
    session_dead: bool,
}

/// One partition's stream record. The owning channel's reader and the fixer
/// are the only writers (mutually exclusive by channel binding); everyone
/// else observes or waits.
pub struct PartitionState {
    id: u16,
    inner: Mutex<Inner>,
    failover_updated: Condvar,
    seqno_updated: Condvar,
    state_changed: Condvar,
}

impl PartitionState {
    pub fn new(id: u16) -> PartitionState {
        PartitionState {
            id,
            inner: Mutex::new(Inner {
                state: StreamState::Disconnected,
                start_seqno: 0,
                end_seqno: 0,
                snapshot_start: 0,
                snapshot_end: 0,
                vbucket_uuid: 0,
                failover_log: Vec::new(),
                current_seqno: 0,
                pending_failover: false,
                pending_seqno: false,
                end_reason: None,
                session_dead: false,
            }),
            failover_updated: Condvar::new(),
            seqno_updated: Condvar::new(),
            state_changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    #[inline]
    pub fn end_reason(&self) -> Option<StreamEndReason> {
        self.lock().end_reason
    }

    #[inline]
    pub fn start_seqno(&self) -> u64 {
        self.lock().start_seqno
    }

    #[inline]
    pub fn snapshot(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.snapshot_start, inner.snapshot_end)
    }

    #[inline]
    pub fn current_seqno(&self) -> u64 {
        self.lock().current_seqno
    }

    #[inline]
    pub fn failover_log(&self) -> Vec<FailoverEntry> {
        self.lock().failover_log.clone()
    }

    /// Seed the record from a caller-supplied stream request.
    pub fn prime(&self, request: &StreamRequest) {
        let mut inner = self.lock();
        inner.start_seqno = request.start_seqno;
        inner.end_seqno = request.end_seqno;
        inner.snapshot_start = request.snapshot_start_seqno;
        inner.snapshot_end = request.snapshot_end_seqno;
        inner.vbucket_uuid = request.vbucket_uuid;
        inner.end_reason = None;
    }

    /// Produce the stream request for (re)opening this partition. The uuid
    /// is the most recent failover entry at or below the resume seqno; with
    /// no such entry the newest lineage is offered and the server answers
    /// with rollback semantics.
    pub fn stream_request(&self) -> StreamRequest {
        let inner = self.lock();

        let vbucket_uuid = if inner.failover_log.is_empty() {
            inner.vbucket_uuid
        } else {
            inner
                .failover_log
                .iter()
                .find(|entry| entry.seqno <= inner.start_seqno)
                .unwrap_or(&inner.failover_log[0])
                .vbucket_uuid
        };

        StreamRequest {
            partition: self.id,
            vbucket_uuid,
            start_seqno: inner.start_seqno,
            end_seqno: inner.end_seqno,
            snapshot_start_seqno: inner.snapshot_start,
            snapshot_end_seqno: inner.snapshot_end,
        }
    }

    /// Mark an outstanding failover-log request.
    pub fn failover_request(&self) {
        self.lock().pending_failover = true;
    }

    /// Mark an outstanding seqno request.
    pub fn seqno_request(&self) {
        self.lock().pending_seqno = true;
    }

    pub fn set_failover_log(&self, log: Vec<FailoverEntry>) {
        let mut inner = self.lock();

        if let Some(newest) = log.first() {
            inner.vbucket_uuid = newest.vbucket_uuid;
        }

        inner.failover_log = log;
        inner.pending_failover = false;
        self.failover_updated.notify_all();
    }

    pub fn set_current_seqno(&self, seqno: u64) {
        let mut inner = self.lock();
        inner.current_seqno = seqno;
        inner.pending_seqno = false;
        self.seqno_updated.notify_all();
    }

    pub fn wait_till_failover_updated(&self, timeout: Duration) -> DcpResult<()> {
        self.wait_pending(timeout, &self.failover_updated, |inner| inner.pending_failover)
    }

    pub fn wait_till_seqno_updated(&self, timeout: Duration) -> DcpResult<()> {
        self.wait_pending(timeout, &self.seqno_updated, |inner| inner.pending_seqno)
    }

    /// Move the open snapshot window.
    pub fn advance_snapshot(&self, start: u64, end: u64) {
        let mut inner = self.lock();
        inner.snapshot_start = start;
        inner.snapshot_end = end;
    }

    /// Record a delivered data message's seqno. Finishing the requested
    /// window closes the stream with an `Ok` end reason.
    pub fn advance_seqno(&self, seqno: u64) -> StreamProgress {
        let mut inner = self.lock();
        inner.start_seqno = seqno;

        if seqno == inner.end_seqno {
            inner.state = StreamState::Disconnected;
            inner.end_reason = Some(StreamEndReason::Ok);
            self.state_changed.notify_all();
            return StreamProgress::Completed;
        }

        StreamProgress::Continue
    }

    /// Rewind to a server-directed rollback point. The snapshot window
    /// collapses onto the resume seqno, restoring the open invariant
    /// `snapshot_start <= start_seqno <= snapshot_end`.
    pub fn rollback_to(&self, seqno: u64) {
        let mut inner = self.lock();
        inner.start_seqno = seqno;
        inner.snapshot_start = seqno;
        inner.snapshot_end = seqno;
        inner.end_reason = None;
    }

    pub fn set_state(&self, state: StreamState) {
        let mut inner = self.lock();
        inner.state = state;

        if state != StreamState::Disconnected {
            inner.end_reason = None;
        }

        self.state_changed.notify_all();
    }

    /// Terminal transition with the reason the stream ended.
    pub fn set_ended(&self, reason: StreamEndReason) {
        let mut inner = self.lock();
        inner.state = StreamState::Disconnected;
        inner.end_reason = Some(reason);
        self.state_changed.notify_all();
    }

    /// Block until the stream reaches `expected`.
    pub fn wait_for_state(&self, expected: StreamState, timeout: Duration) -> DcpResult<()> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if inner.state == expected {
                return Ok(());
            }
            if inner.session_dead {
                return Err(DcpError::SessionDisconnected);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(DcpError::TimedOut),
            };

            let (guard, _) = self.state_changed.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
    }

    fn wait_pending<F>(&self, timeout: Duration, condvar: &Condvar, pending: F) -> DcpResult<()>
    where
        F: Fn(&Inner) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if !pending(&inner) {
                return Ok(());
            }
            if inner.session_dead {
                return Err(DcpError::SessionDisconnected);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => return Err(DcpError::TimedOut),
            };

            let (guard, _) = condvar.wait_timeout(inner, remaining).unwrap();
            inner = guard;
        }
    }

    /// Session teardown: force `Disconnected` and wake every waiter so they
    /// observe `SessionDisconnected`.
    fn kill(&self) {
        let mut inner = self.lock();
        inner.state = StreamState::Disconnected;
        inner.session_dead = true;
        self.failover_updated.notify_all();
        self.seqno_updated.notify_all();
        self.state_changed.notify_all();
    }

    fn revive(&self) {
        self.lock().session_dead = false;
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("partition state poisoned")
    }
}

/// The per-bucket session: one `PartitionState` per vbucket plus the
/// lifecycle flags. Created on the first successful connect and reused by
/// reconnects so progress survives.
pub struct SessionState {
    partitions: Vec<Arc<PartitionState>>,
    connected: AtomicBool,
    disconnected: AtomicBool,
}

impl SessionState {
    pub fn new(num_partitions: u16) -> SessionState {
        SessionState {
            partitions: (0..num_partitions).map(|id| Arc::new(PartitionState::new(id))).collect(),
            connected: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.partitions.len() as u16
    }

    #[inline]
    pub fn get(&self, partition: u16) -> DcpResult<Arc<PartitionState>> {
        self.partitions
            .get(partition as usize)
            .cloned()
            .ok_or(DcpError::InvariantViolation("partition outside session"))
    }

    #[inline]
    pub fn partitions(&self) -> &[Arc<PartitionState>] {
        &self.partitions
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Bring the session (back) up, clearing any prior teardown marks.
    pub fn set_connected(&self) {
        for partition in &self.partitions {
            partition.revive();
        }
        self.disconnected.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /// Tear the session down: every partition goes `Disconnected` and every
    /// condition is signaled.
    pub fn set_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
        self.disconnected.store(true, Ordering::Release);
        for partition in &self.partitions {
            partition.kill();
        }
    }
}

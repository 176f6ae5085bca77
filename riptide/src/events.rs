//! The event queue that breaks the Conductor/Channel/Fixer reference cycle,
//! and the handler capabilities the embedder plugs in. Channels hold only a
//! sink; the fixer holds the receiver; the conductor owns the queue.

use crate::config::BucketConfig;
use crate::error::DcpError;
use brine::message::{DataMessage, StreamEndReason};
use mio::{Ready, SetReadiness};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Everything the repair loop reacts to. Closed set; the fixer pattern
/// matches exhaustively.
#[derive(Debug, Clone)]
pub enum DcpEvent {
    ChannelDropped {
        address: SocketAddr,
        partitions: Vec<u16>,
        cause: DcpError,
    },
    StreamEnd {
        partition: u16,
        reason: StreamEndReason,
    },
    Rollback {
        partition: u16,
        seqno: u64,
    },
    NotMyVbucket {
        partition: u16,
    },
    ConfigRevision(BucketConfig),
    Failed {
        partition: u16,
        error: DcpError,
    },
    Poison,
}

/// Cloneable publishing end of the event queue. Once the receiving side is
/// gone the send silently drops: the owner has shut down and there is
/// nothing left to repair.
#[derive(Clone)]
pub struct EventSink {
    tx: Arc<Mutex<Sender<DcpEvent>>>,
}

impl EventSink {
    pub fn publish(&self, event: DcpEvent) {
        let _ = self.tx.lock().unwrap().send(event);
    }

    /// Swap in a fresh sender. Every clone of this sink follows: used on
    /// disconnect so a reconnected client gets an empty queue.
    pub(crate) fn replace(&self, tx: Sender<DcpEvent>) {
        *self.tx.lock().unwrap() = tx;
    }
}

pub fn event_queue() -> (EventSink, Receiver<DcpEvent>) {
    let (tx, rx) = mpsc::channel();
    (EventSink { tx: Arc::new(Mutex::new(tx)) }, rx)
}

/// Flow-control credit return. Handed to the data handler alongside every
/// message; the embedder calls `ack` once it is done with the bytes, and the
/// owning channel turns accumulated credit into a buffer acknowledgement.
#[derive(Clone)]
pub struct AckHandle {
    acked: Arc<AtomicU64>,
    wake: SetReadiness,
}

impl AckHandle {
    pub(crate) fn new(acked: Arc<AtomicU64>, wake: SetReadiness) -> AckHandle {
        AckHandle { acked, wake }
    }

    pub fn ack(&self, bytes: u32) {
        self.acked.fetch_add(u64::from(bytes), Ordering::Relaxed);
        let _ = self.wake.set_readiness(Ready::readable());
    }
}

/// Snapshot markers and stream terminations, in partition order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ControlEvent {
    SnapshotMarker {
        partition: u16,
        start_seqno: u64,
        end_seqno: u64,
        flags: u32,
    },
    StreamEnd {
        partition: u16,
        reason: StreamEndReason,
    },
}

/// Out-of-band notifications: topology movement, failures, rollbacks.
#[derive(Debug, Clone)]
pub enum SystemEvent {
    ChannelDropped { address: SocketAddr },
    ConfigUpdated { rev: u64 },
    PartitionRerouted { partition: u16 },
    Rollback { partition: u16, seqno: u64 },
    PartitionFailed { partition: u16, error: DcpError },
}

/// Receives every mutation, deletion and expiration. Invoked from the
/// owning channel's reader; implementations must not block. Backpressure is
/// expressed by withholding `ack`, not by stalling the reader.
pub trait DataEventHandler: Send + Sync {
    fn on_event(&self, ack: &AckHandle, message: DataMessage);
}

pub trait ControlEventHandler: Send + Sync {
    fn on_event(&self, event: ControlEvent);
}

pub trait SystemEventHandler: Send + Sync {
    fn on_event(&self, event: SystemEvent);
}

/// Swallows everything and immediately returns the flow-control credit.
/// The default when the embedder only cares about a subset of the streams.
pub struct DiscardHandler;

impl DataEventHandler for DiscardHandler {
    fn on_event(&self, ack: &AckHandle, message: DataMessage) {
        let bytes = match &message {
            DataMessage::Mutation(m) => m.key.len() + m.value.len(),
            DataMessage::Deletion(r) | DataMessage::Expiration(r) => r.key.len(),
        };
        ack.ack(bytes as u32 + brine::HEADER_SIZE as u32);
    }
}

impl ControlEventHandler for DiscardHandler {
    fn on_event(&self, _event: ControlEvent) {}
}

impl SystemEventHandler for DiscardHandler {
    fn on_event(&self, _event: SystemEvent) {}
}

/// The three embedder capabilities bundled for injection.
#[derive(Clone)]
pub struct Handlers {
    pub data: Arc<dyn DataEventHandler>,
    pub control: Arc<dyn ControlEventHandler>,
    pub system: Arc<dyn SystemEventHandler>,
}

impl Handlers {
    pub fn discard() -> Handlers {
        let discard = Arc::new(DiscardHandler);
        Handlers {
            data: discard.clone(),
            control: discard.clone(),
            system: discard,
        }
    }
}

//! `riptide` is a partition-aware streaming client for the Couchbase
//! Database Change Protocol. It opens one binary connection per master node,
//! negotiates DCP streams for the bucket's vbuckets, delivers mutations in
//! per-partition seqno order and repairs itself across node failures,
//! topology changes and transient connection loss.
//!
//! The [`Conductor`] is the public façade; everything else hangs off it.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod conductor;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod net;
pub mod retry;
pub mod session;
pub mod settings;

pub(crate) mod fixer;

#[cfg(test)]
pub(crate) mod testkit;

pub use crate::conductor::Conductor;
pub use crate::config::{BucketConfig, ConfigProvider, StaticProvider};
pub use crate::net::{ChannelState, DcpChannel};
pub use crate::error::{DcpError, DcpResult};
pub use crate::events::{
    AckHandle, ControlEvent, ControlEventHandler, DataEventHandler, Handlers, SystemEvent,
    SystemEventHandler,
};
pub use crate::retry::{Delay, RetryPolicy};
pub use crate::session::{PartitionState, SessionState, StreamState};
pub use crate::settings::ClientSettings;

pub use brine::message::{
    DataMessage, FailoverEntry, Mutation, Removal, StreamEndReason, StreamRequest, NO_END_SEQNO,
};

//! The wire layer for the Couchbase memcached binary protocol as spoken by
//! DCP producers. Everything in here is socket-free: framing, opcode and
//! status tables, typed message parsing and the byte FIFO sitting between a
//! non-blocking stream and the framer.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod error;
pub mod frame;
pub mod message;

pub use crate::error::{ErrorUtils, WireError, WireFault, WireResult};
pub use crate::frame::{Frame, Header, Magic, Opcode, Status, HEADER_SIZE};

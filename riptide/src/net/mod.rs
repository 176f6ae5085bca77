//! The networking module owns the per-node DCP connections: handshake,
//! stream lifecycle, inbound dispatch and flow control.

pub mod channel;

pub use self::channel::{ChannelState, DcpChannel};

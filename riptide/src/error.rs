use brine::error::{WireError, WireFault};
use std::io;

pub type DcpResult<T> = Result<T, DcpError>;

/// Client-level failures. Transient kinds are retried internally and never
/// escape the core; the rest surface to the embedder.
#[derive(Debug, Clone, PartialEq)]
pub enum DcpError {
    /// The server reported momentary pressure (TMPFAIL / EBUSY).
    TmpFail,
    Io(io::ErrorKind),
    /// The peer went away mid-conversation.
    ConnectionClosed,
    TimedOut,
    /// The addressed node is no longer master for the partition.
    NotMyVbucket { partition: u16 },
    AuthFailed,
    BucketNotFound,
    UnknownOpcode(u8),
    /// A response status this client has no handling for.
    UnexpectedStatus(u16),
    /// Frame-level corruption on the wire.
    Wire(WireFault),
    /// Returned to any blocked waiter once `disconnect()` runs.
    SessionDisconnected,
    /// Retry budget exhausted; carries the terminal cause.
    CannotRetry { attempts: u32, cause: Box<DcpError> },
    /// Internal inconsistency, e.g. a partition with no master. Fatal and
    /// non-recoverable.
    InvariantViolation(&'static str),
    Config(String),
}

impl DcpError {
    /// Errors worth another attempt: server pressure, connection hiccups and
    /// handshake timeouts. An exhausted inner retry budget inherits its
    /// cause's classification, so an outer repair loop keeps trying through
    /// a run of connection failures.
    pub fn is_transient(&self) -> bool {
        match self {
            DcpError::TmpFail
            | DcpError::Io(_)
            | DcpError::ConnectionClosed
            | DcpError::TimedOut => true,
            DcpError::CannotRetry { cause, .. } => cause.is_transient(),
            _ => false,
        }
    }
}

impl From<io::Error> for DcpError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => DcpError::TimedOut,
            io::ErrorKind::UnexpectedEof => DcpError::ConnectionClosed,
            kind => DcpError::Io(kind),
        }
    }
}

impl From<WireError> for DcpError {
    #[inline]
    fn from(wire_error: WireError) -> Self {
        match wire_error {
            // `Wait` only escapes the wire layer on a blocking call that ran
            // out its socket timeout.
            WireError::Wait => DcpError::TimedOut,
            WireError::Closed => DcpError::ConnectionClosed,
            WireError::Fatal(fault) => DcpError::Wire(fault),
        }
    }
}

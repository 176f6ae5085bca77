use std::io;

pub type WireResult<T> = Result<T, WireError>;

/// Wire-level errors. `Wait` is not a failure: it means the operation ran out
/// of data (or capacity) and should be retried once the socket turns ready.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum WireError {
    Wait,
    /// The peer closed the connection.
    Closed,
    Fatal(WireFault),
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum WireFault {
    BadMagic(u8),
    UnknownOpcode(u8),
    /// Header field lengths disagree with the body length.
    BadFrame,
    FrameTooLarge(usize),
    /// A typed message body was shorter than its fixed layout requires.
    ShortBody,
    Io(io::ErrorKind),
}

impl From<io::Error> for WireError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => WireError::Wait,
            io::ErrorKind::UnexpectedEof => WireError::Closed,
            kind => WireError::Fatal(WireFault::Io(kind)),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for WireResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(WireError::Wait) => false,
            _ => true,
        }
    }
}

use std::fmt;
use std::io;
use std::result::Result as StdResult;

pub type Result<T> = StdResult<T, MuxError>;

/// Errors surfaced by the selector, channels, and the worker pool.
#[derive(Debug)]
pub enum MuxError {
    /// The selector has been closed.
    ClosedSelector,
    /// The channel has been closed.
    ClosedChannel,
    /// The selection key was cancelled by its selector.
    CancelledKey,
    /// Registration attempted on a channel in blocking mode.
    IllegalBlockingMode,
    /// The channel does not belong to this selector implementation.
    IllegalSelector,
    /// The interest set contains operations the channel does not support.
    UnsupportedOps,
    /// Blocking I/O was aborted because the calling thread was interrupted;
    /// the channel is left closed.
    ClosedByInterrupt,
    /// Blocking I/O was aborted because another thread closed the channel.
    AsynchronousClose,
    /// A blocking wait was interrupted; the thread's interrupt status is cleared.
    Interrupted,
    /// The pool cannot accept the task (saturated or shut down).
    Rejected(String),
    /// Unexpected error from a syscall.
    Io(io::Error),
}

impl fmt::Display for MuxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxError::ClosedSelector => write!(f, "selector is closed"),
            MuxError::ClosedChannel => write!(f, "channel is closed"),
            MuxError::CancelledKey => write!(f, "selection key has been cancelled"),
            MuxError::IllegalBlockingMode => {
                write!(f, "channel is in blocking mode")
            }
            MuxError::IllegalSelector => {
                write!(f, "channel was not created for this selector")
            }
            MuxError::UnsupportedOps => {
                write!(f, "interest set not supported by this channel")
            }
            MuxError::ClosedByInterrupt => {
                write!(f, "channel closed by thread interruption")
            }
            MuxError::AsynchronousClose => {
                write!(f, "channel closed asynchronously during blocking I/O")
            }
            MuxError::Interrupted => write!(f, "blocking wait interrupted"),
            MuxError::Rejected(msg) => write!(f, "task rejected: {}", msg),
            MuxError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for MuxError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MuxError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for MuxError {
    fn from(err: io::Error) -> Self {
        MuxError::Io(err)
    }
}

impl MuxError {
    /// True if this is a `WouldBlock` I/O error, the normal outcome of a
    /// non-blocking operation that has nothing to do yet.
    pub fn is_would_block(&self) -> bool {
        matches!(self, MuxError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

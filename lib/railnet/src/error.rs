use std::fmt;
use std::io;

pub type RailResult<T> = Result<T, RailError>;

/// Error taxonomy of the engine. `Again` is transient fabric backpressure:
/// it is recovered internally through the pending-retry queue and must never
/// be surfaced through the library vtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RailError {
    /// The fabric cannot accept the post right now. Retry on the next poll.
    Again,
    /// Invalid argument or state supplied by the caller.
    Invalid(&'static str),
    /// A message exceeds the receiver's advertised buffer.
    MessageSize { size: usize, limit: usize },
    /// The two peers disagree about the protocol state.
    Protocol(&'static str),
    /// A pool, freelist or inflight ceiling is exhausted.
    Resource(&'static str),
    /// The requested capability is not available on this build or fabric.
    NotSupported(&'static str),
    /// The peer or the path to it failed.
    Remote(&'static str),
    /// A fatal fabric-level failure.
    Fabric(FabricFault),
    Io(io::ErrorKind),
}

/// Fabric completion faults, as reported through completion-queue error
/// entries or failed posts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricFault {
    /// Remote side rejected access to the target memory region.
    RemoteAccess,
    /// Remote side failed while executing the operation.
    RemoteOp,
    /// The peer endpoint is gone or was never reachable.
    Unreachable,
    /// Local memory registration did not cover the posted buffer.
    LocalProtection,
    /// The incoming message did not fit the posted buffer.
    Truncated,
    /// Any other provider-reported failure.
    Other,
}

impl FabricFault {
    /// True for faults attributable to the remote peer rather than this
    /// process, which the library maps onto its remote-error code.
    #[inline]
    pub fn is_remote(self) -> bool {
        matches!(
            self,
            FabricFault::RemoteAccess | FabricFault::RemoteOp | FabricFault::Unreachable
        )
    }
}

/// Result codes of the library vtable (spec exit-code mapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetCode {
    Success,
    InternalError,
    InvalidArgument,
    RemoteError,
    SystemError,
}

impl RailError {
    /// Collapse the taxonomy onto the five codes the host library
    /// understands. `Again` has no mapping: callers must have retried it
    /// away before reporting.
    pub fn code(&self) -> NetCode {
        match self {
            RailError::Again => {
                debug_assert!(false, "Again must not escape to the vtable");
                NetCode::SystemError
            }
            RailError::Invalid(_) | RailError::Protocol(_) => NetCode::InternalError,
            RailError::MessageSize { .. } => NetCode::InvalidArgument,
            RailError::Remote(_) => NetCode::RemoteError,
            RailError::Fabric(fault) if fault.is_remote() => NetCode::RemoteError,
            RailError::Fabric(_) => NetCode::SystemError,
            RailError::Resource(_) | RailError::NotSupported(_) | RailError::Io(_) => {
                NetCode::SystemError
            }
        }
    }
}

impl fmt::Display for RailError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RailError::Again => write!(f, "fabric busy, try again"),
            RailError::Invalid(what) => write!(f, "invalid argument: {}", what),
            RailError::MessageSize { size, limit } => {
                write!(f, "message of {} bytes exceeds receiver buffer of {}", size, limit)
            }
            RailError::Protocol(what) => write!(f, "protocol violation: {}", what),
            RailError::Resource(what) => write!(f, "out of resources: {}", what),
            RailError::NotSupported(what) => write!(f, "not supported: {}", what),
            RailError::Remote(what) => write!(f, "remote failure: {}", what),
            RailError::Fabric(fault) => write!(f, "fabric fault: {:?}", fault),
            RailError::Io(kind) => write!(f, "io failure: {:?}", kind),
        }
    }
}

impl std::error::Error for RailError {}

impl From<io::Error> for RailError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => RailError::Again,
            kind => RailError::Io(kind),
        }
    }
}

/// Distinguishes hard failures from transient backpressure.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for RailResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(RailError::Again) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping() {
        assert_eq!(RailError::Invalid("x").code(), NetCode::InternalError);
        assert_eq!(RailError::Protocol("x").code(), NetCode::InternalError);
        assert_eq!(
            RailError::MessageSize { size: 2, limit: 1 }.code(),
            NetCode::InvalidArgument
        );
        assert_eq!(RailError::Remote("gone").code(), NetCode::RemoteError);
        assert_eq!(
            RailError::Fabric(FabricFault::RemoteAccess).code(),
            NetCode::RemoteError
        );
        assert_eq!(
            RailError::Fabric(FabricFault::LocalProtection).code(),
            NetCode::SystemError
        );
        assert_eq!(RailError::Resource("pool").code(), NetCode::SystemError);
    }

    #[test]
    fn test_has_failed() {
        assert!(!Ok::<(), RailError>(()).has_failed());
        assert!(!Err::<(), _>(RailError::Again).has_failed());
        assert!(Err::<(), _>(RailError::Invalid("x")).has_failed());
    }

    #[test]
    fn test_wouldblock_folds_to_again() {
        let err: RailError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, RailError::Again);
    }
}

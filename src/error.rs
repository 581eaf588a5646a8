//! Error types for the resilient connection layer.

use std::io;

use thiserror::Error;

use crate::keepalive::ErrorClass;

/// Failure to establish an upstream connection.
#[derive(Debug, Error)]
pub enum DialError {
    /// Every attempt in the retry budget failed.
    #[error("dial to {target} failed after {attempts} attempts: {source}")]
    Exhausted {
        target: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    /// The retry loop was interrupted by shutdown.
    #[error("dial to {target} cancelled after {attempts} attempts")]
    Cancelled { target: String, attempts: u32 },

    /// The target could not be parsed as `host:port`.
    #[error("invalid dial target: {0:?}")]
    InvalidTarget(String),
}

impl DialError {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            DialError::Exhausted { attempts, .. } | DialError::Cancelled { attempts, .. } => {
                *attempts
            }
            DialError::InvalidTarget(_) => 0,
        }
    }
}

/// Unrecoverable connection fault raised under the `fatal` error policy.
///
/// Travels inside the `std::io::Error` returned from the failing read or
/// write, and is also delivered to the [`FaultSupervisor`] so the process can
/// be brought down by its owner instead of from inside a library call.
///
/// [`FaultSupervisor`]: crate::supervisor::FaultSupervisor
#[derive(Debug, Clone, Error)]
#[error("fatal {op} fault on {peer} ({class}): {kind:?}: {message}")]
pub struct FatalFault {
    pub peer: String,
    pub op: IoOp,
    pub class: ErrorClass,
    pub kind: io::ErrorKind,
    pub message: String,
}

impl FatalFault {
    /// Wrap into the `io::Error` handed back to the caller.
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::Other, self)
    }

    /// Recover the fault from an error produced by [`FatalFault::into_io_error`].
    pub fn from_io_error(err: &io::Error) -> Option<&FatalFault> {
        err.get_ref()?.downcast_ref::<FatalFault>()
    }
}

/// Which side of the byte stream failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
}

impl std::fmt::Display for IoOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoOp::Read => f.write_str("read"),
            IoOp::Write => f.write_str("write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_fault_survives_io_error_roundtrip() {
        let fault = FatalFault {
            peer: "example.com:443".to_string(),
            op: IoOp::Write,
            class: ErrorClass::Generic,
            kind: io::ErrorKind::TimedOut,
            message: "deadline elapsed".to_string(),
        };

        let err = fault.into_io_error();
        let recovered = FatalFault::from_io_error(&err).expect("fault payload");
        assert_eq!(recovered.op, IoOp::Write);
        assert_eq!(recovered.kind, io::ErrorKind::TimedOut);

        let plain = io::Error::new(io::ErrorKind::Other, "boom");
        assert!(FatalFault::from_io_error(&plain).is_none());
    }

    #[test]
    fn test_dial_error_attempts() {
        let err = DialError::Cancelled {
            target: "a:1".to_string(),
            attempts: 3,
        };
        assert_eq!(err.attempts(), 3);
        assert!(err.to_string().contains("cancelled"));
    }
}

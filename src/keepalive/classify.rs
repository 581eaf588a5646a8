//! I/O error classification

use std::fmt;
use std::io;

/// Transport conditions that probing is expected to help with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCondition {
    BrokenPipe,
    ConnectionReset,
    NetworkUnreachable,
}

/// Coarse category of a failed read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RecoverableNetwork(NetworkCondition),
    Generic,
}

impl ErrorClass {
    /// Classify on the structured error kind, never on the message text.
    pub fn of(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe => {
                ErrorClass::RecoverableNetwork(NetworkCondition::BrokenPipe)
            }
            io::ErrorKind::ConnectionReset => {
                ErrorClass::RecoverableNetwork(NetworkCondition::ConnectionReset)
            }
            io::ErrorKind::NetworkUnreachable => {
                ErrorClass::RecoverableNetwork(NetworkCondition::NetworkUnreachable)
            }
            _ => ErrorClass::Generic,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorClass::RecoverableNetwork(_))
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::RecoverableNetwork(NetworkCondition::BrokenPipe) => f.write_str("broken pipe"),
            ErrorClass::RecoverableNetwork(NetworkCondition::ConnectionReset) => {
                f.write_str("connection reset")
            }
            ErrorClass::RecoverableNetwork(NetworkCondition::NetworkUnreachable) => {
                f.write_str("network unreachable")
            }
            ErrorClass::Generic => f.write_str("generic"),
        }
    }
}

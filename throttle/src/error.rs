//! Unified error type for the throttle subsystem.
//!
//! Covers configuration parsing, group/device setup, and queue lifecycle.
//! The bio dispatch path itself never returns an error: a bio either
//! dispatches, is queued, or is force-issued during drain.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    NoMemory,
    InvalidArgument { reason: &'static str },
    DeviceDying,
    Busy,
}

impl fmt::Display for ThrottleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of memory for throttle group allocation"),
            Self::InvalidArgument { reason } => write!(f, "invalid argument: {}", reason),
            Self::DeviceDying => write!(f, "device queue is tearing down"),
            Self::Busy => write!(f, "device queue is in bypass mode, retry"),
        }
    }
}

/// Convenience result type for throttle subsystem operations.
pub type ThrottleResult<T = ()> = Result<T, ThrottleError>;

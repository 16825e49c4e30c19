use smol_str::SmolStr;
use std::fmt;
use std::panic::Location;
use thiserror::Error;

/// Status code reported by the one-sided communication runtime.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    Buffer = 1,
    Root = 2,
    Rank = 3,
    Arg = 4,
    Size = 5,
    NoMem = 6,
    Win = 7,
    RmaRange = 8,
    RmaAttach = 9,
    RmaSync = 10,
    Intern = 11,
    Aborted = 12,
    Other = 15,
}

impl Status {
    pub fn code(self) -> i32 {
        self as i32
    }

    fn name(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Buffer => "invalid buffer",
            Status::Root => "invalid root",
            Status::Rank => "invalid rank",
            Status::Arg => "invalid argument",
            Status::Size => "invalid size",
            Status::NoMem => "out of memory",
            Status::Win => "invalid window",
            Status::RmaRange => "target memory out of window range",
            Status::RmaAttach => "misaligned or unattached target memory",
            Status::RmaSync => "wrong synchronization of remote access",
            Status::Intern => "internal runtime error",
            Status::Aborted => "peer rank aborted",
            Status::Other => "unknown error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[derive(Error, Debug)]
pub enum RmaError {
    #[error("Failed to {info} at {location}: {status}")]
    Runtime {
        info: SmolStr,
        location: &'static Location<'static>,
        status: Status,
    },
    #[error("{field} value {value} does not fit into {bits} bits")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },
    #[error("Invalid delay: {0}")]
    InvalidDelay(SmolStr),
    #[error("Invalid config {0}: {1}")]
    InvalidConfig(SmolStr, SmolStr),
    #[error("Invalid transition in FSM: {0}")]
    InvalidTransition(SmolStr),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RmaError {
    /// Runtime failure attributed to the caller's source location.
    #[track_caller]
    pub fn runtime(info: impl Into<SmolStr>, status: Status) -> Self {
        RmaError::Runtime {
            info: info.into(),
            location: Location::caller(),
            status,
        }
    }

    pub fn status(&self) -> Option<Status> {
        match self {
            RmaError::Runtime { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<&'static Location<'static>> {
        match self {
            RmaError::Runtime { location, .. } => Some(location),
            _ => None,
        }
    }
}

pub type Result<T, E = RmaError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_carries_caller_location() {
        let line = line!() + 1;
        let err = RmaError::runtime("attach window", Status::Win);
        let location = err.location().expect("location");
        assert_eq!(location.file(), file!());
        assert_eq!(location.line(), line);
        assert_eq!(err.status(), Some(Status::Win));
        let msg = err.to_string();
        assert!(msg.starts_with("Failed to attach window at "));
        assert!(msg.ends_with("invalid window (7)"));
    }

    #[test]
    fn non_runtime_errors_have_no_status() {
        let err = RmaError::FieldOverflow {
            field: "rank",
            value: 9000,
            bits: 13,
        };
        assert_eq!(err.status(), None);
        assert_eq!(err.to_string(), "rank value 9000 does not fit into 13 bits");
    }
}

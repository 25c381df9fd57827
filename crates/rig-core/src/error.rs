use crate::bus::BusError;
use crate::gas::GasDeviceKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RigError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("{what} {value} out of range {min}..={max}")]
    Range {
        what: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("unknown direction {0:?}")]
    UnknownDirection(String),
    #[error("unknown device {0:?}")]
    UnknownDevice(String),
    #[error("{operation} is not supported by {kind} devices")]
    Unsupported {
        operation: &'static str,
        kind: GasDeviceKind,
    },
    #[error("{device} block [{start}, {end}) overlaps existing block [{other_start}, {other_end})")]
    Conflict {
        device: String,
        start: u32,
        end: u32,
        other_start: u32,
        other_end: u32,
    },
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("no block {0}")]
    UnknownBlock(String),
    #[error("schedule file: {0}")]
    Persist(#[from] std::io::Error),
    #[error("schedule format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("schedule engine is not running")]
    EngineUnavailable,
}

impl RigError {
    pub(crate) fn range(what: &'static str, value: impl Into<i64>, min: i64, max: i64) -> Self {
        RigError::Range {
            what,
            value: value.into(),
            min,
            max,
        }
    }

    /// Failures that came back from the wire rather than from validation.
    pub fn is_communication(&self) -> bool {
        matches!(self, RigError::Bus(_))
    }
}

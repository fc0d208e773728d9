//! Crate-wide error type.
//!
//! Structural errors (`MalformedTable`, `OutOfBounds`, `IrregularId`) are
//! returned before any state is touched. `Persistence` and `Busy` are
//! retryable; `IdSpaceExhausted` halts every further mutation of the project.

use thiserror::Error;

use crate::label::Coord;

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("malformed lookup table: {0}")]
    MalformedTable(String),

    #[error("coordinate {coord:?} lies outside volume extent {extent:?}")]
    OutOfBounds { coord: Coord, extent: [u64; 3] },

    #[error("id {0} is a reserved sentinel, expected a regular id")]
    IrregularId(u64),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("invalid dataset format: {0}")]
    InvalidFormat(String),

    #[error("brush radius {0} must be finite and non-negative")]
    InvalidRadius(f64),

    #[error("id space exhausted")]
    IdSpaceExhausted,

    #[error("project is read-only after id space exhaustion")]
    Halted,

    #[error("a persist is already in flight")]
    Busy,

    #[error("background job failed: {0}")]
    JobFailed(String),
}

impl LabelError {
    /// True for failures the user can retry without losing session state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LabelError::Persistence(_) | LabelError::Busy)
    }
}

impl From<std::io::Error> for LabelError {
    fn from(e: std::io::Error) -> Self {
        LabelError::Persistence(format!("I/O error: {}", e))
    }
}

impl From<Box<bincode::ErrorKind>> for LabelError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        match *e {
            bincode::ErrorKind::Io(io) => LabelError::Persistence(format!("I/O error: {}", io)),
            other => LabelError::InvalidFormat(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LabelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LabelError::Busy.is_retryable());
        assert!(LabelError::Persistence("disk full".into()).is_retryable());
        assert!(!LabelError::IdSpaceExhausted.is_retryable());
        assert!(!LabelError::MalformedTable("dup".into()).is_retryable());
    }

    #[test]
    fn io_errors_become_persistence_errors() {
        let err: LabelError = std::io::Error::other("boom").into();
        assert!(matches!(err, LabelError::Persistence(_)));
    }
}

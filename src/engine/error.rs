use ulid::Ulid;

use crate::model::{FacilityId, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    InvalidInterval { start: i64, end: i64 },
    Validation(&'static str),
    FacilityNotFound(FacilityId),
    FacilityUnavailable(FacilityId),
    NotFound(Ulid),
    DuplicateRequest(Ulid),
    CapacityExceeded { capacity: u32, span: Span },
    Unauthorized(&'static str),
    TransactionConflict { attempts: u32 },
    Timeout,
    Storage(String),
}

/// Stable machine-readable error class, independent of message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInterval,
    Validation,
    FacilityNotFound,
    FacilityUnavailable,
    NotFound,
    DuplicateRequest,
    CapacityExceeded,
    Unauthorized,
    TransactionConflict,
    Timeout,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInterval => "invalid_interval",
            ErrorKind::Validation => "validation",
            ErrorKind::FacilityNotFound => "facility_not_found",
            ErrorKind::FacilityUnavailable => "facility_unavailable",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DuplicateRequest => "duplicate_request",
            ErrorKind::CapacityExceeded => "capacity_exceeded",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::TransactionConflict => "transaction_conflict",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Storage => "storage",
        }
    }

    /// True when the same request may succeed if simply resubmitted.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransactionConflict | ErrorKind::Timeout | ErrorKind::Storage
        )
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidInterval { .. } => ErrorKind::InvalidInterval,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::FacilityNotFound(_) => ErrorKind::FacilityNotFound,
            EngineError::FacilityUnavailable(_) => ErrorKind::FacilityUnavailable,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::DuplicateRequest(_) => ErrorKind::DuplicateRequest,
            EngineError::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            EngineError::Unauthorized(_) => ErrorKind::Unauthorized,
            EngineError::TransactionConflict { .. } => ErrorKind::TransactionConflict,
            EngineError::Timeout => ErrorKind::Timeout,
            EngineError::Storage(_) => ErrorKind::Storage,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval: start {start} must be before end {end}")
            }
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::FacilityNotFound(id) => write!(f, "facility not found: {id}"),
            EngineError::FacilityUnavailable(id) => {
                write!(f, "facility {id} is not open for reservations")
            }
            EngineError::NotFound(id) => write!(f, "reservation not found: {id}"),
            EngineError::DuplicateRequest(existing) => {
                write!(f, "duplicate request: already holding reservation {existing} for this slot")
            }
            EngineError::CapacityExceeded { capacity, span } => {
                write!(f, "capacity {capacity} exceeded for {span}: facility is full")
            }
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::TransactionConflict { attempts } => {
                write!(f, "transaction conflict after {attempts} attempts, retry later")
            }
            EngineError::Timeout => write!(f, "timed out before commit, nothing was written"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_kinds_are_retryable() {
        assert!(EngineError::TransactionConflict { attempts: 5 }.kind().is_retryable());
        assert!(EngineError::Timeout.kind().is_retryable());
        assert!(
            !EngineError::CapacityExceeded {
                capacity: 1,
                span: Span::new(0, 1)
            }
            .kind()
            .is_retryable()
        );
        assert!(!EngineError::NotFound(Ulid::new()).kind().is_retryable());
        assert!(!EngineError::Unauthorized("x").kind().is_retryable());
    }

    #[test]
    fn kind_codes_are_stable() {
        assert_eq!(ErrorKind::CapacityExceeded.as_str(), "capacity_exceeded");
        assert_eq!(
            EngineError::DuplicateRequest(Ulid::new()).kind().as_str(),
            "duplicate_request"
        );
    }
}

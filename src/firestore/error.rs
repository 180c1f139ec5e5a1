use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FirestoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl FirestoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirestoreErrorCode::Cancelled => "firestore/cancelled",
            FirestoreErrorCode::Unknown => "firestore/unknown",
            FirestoreErrorCode::InvalidArgument => "firestore/invalid-argument",
            FirestoreErrorCode::DeadlineExceeded => "firestore/deadline-exceeded",
            FirestoreErrorCode::NotFound => "firestore/not-found",
            FirestoreErrorCode::AlreadyExists => "firestore/already-exists",
            FirestoreErrorCode::PermissionDenied => "firestore/permission-denied",
            FirestoreErrorCode::ResourceExhausted => "firestore/resource-exhausted",
            FirestoreErrorCode::FailedPrecondition => "firestore/failed-precondition",
            FirestoreErrorCode::Aborted => "firestore/aborted",
            FirestoreErrorCode::OutOfRange => "firestore/out-of-range",
            FirestoreErrorCode::Unimplemented => "firestore/unimplemented",
            FirestoreErrorCode::Internal => "firestore/internal",
            FirestoreErrorCode::Unavailable => "firestore/unavailable",
            FirestoreErrorCode::DataLoss => "firestore/data-loss",
            FirestoreErrorCode::Unauthenticated => "firestore/unauthenticated",
        }
    }

    /// Maps a numeric gRPC status (as carried by watch `cause` frames) to a code.
    pub fn from_grpc_code(code: i32) -> Self {
        match code {
            1 => FirestoreErrorCode::Cancelled,
            2 => FirestoreErrorCode::Unknown,
            3 => FirestoreErrorCode::InvalidArgument,
            4 => FirestoreErrorCode::DeadlineExceeded,
            5 => FirestoreErrorCode::NotFound,
            6 => FirestoreErrorCode::AlreadyExists,
            7 => FirestoreErrorCode::PermissionDenied,
            8 => FirestoreErrorCode::ResourceExhausted,
            9 => FirestoreErrorCode::FailedPrecondition,
            10 => FirestoreErrorCode::Aborted,
            11 => FirestoreErrorCode::OutOfRange,
            12 => FirestoreErrorCode::Unimplemented,
            13 => FirestoreErrorCode::Internal,
            14 => FirestoreErrorCode::Unavailable,
            15 => FirestoreErrorCode::DataLoss,
            16 => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }

    /// Maps the textual status names used by the REST surface.
    pub fn from_status_name(status: &str) -> Self {
        match status {
            "CANCELLED" => FirestoreErrorCode::Cancelled,
            "INVALID_ARGUMENT" => FirestoreErrorCode::InvalidArgument,
            "DEADLINE_EXCEEDED" => FirestoreErrorCode::DeadlineExceeded,
            "NOT_FOUND" => FirestoreErrorCode::NotFound,
            "ALREADY_EXISTS" => FirestoreErrorCode::AlreadyExists,
            "PERMISSION_DENIED" => FirestoreErrorCode::PermissionDenied,
            "RESOURCE_EXHAUSTED" => FirestoreErrorCode::ResourceExhausted,
            "FAILED_PRECONDITION" => FirestoreErrorCode::FailedPrecondition,
            "ABORTED" => FirestoreErrorCode::Aborted,
            "OUT_OF_RANGE" => FirestoreErrorCode::OutOfRange,
            "UNIMPLEMENTED" => FirestoreErrorCode::Unimplemented,
            "INTERNAL" => FirestoreErrorCode::Internal,
            "UNAVAILABLE" => FirestoreErrorCode::Unavailable,
            "DATA_LOSS" => FirestoreErrorCode::DataLoss,
            "UNAUTHENTICATED" => FirestoreErrorCode::Unauthenticated,
            _ => FirestoreErrorCode::Unknown,
        }
    }
}

/// Returns `true` when an error with this code will not go away by retrying.
pub fn is_permanent_error(code: FirestoreErrorCode) -> bool {
    match code {
        FirestoreErrorCode::Cancelled
        | FirestoreErrorCode::Unknown
        | FirestoreErrorCode::DeadlineExceeded
        | FirestoreErrorCode::ResourceExhausted
        | FirestoreErrorCode::Internal
        | FirestoreErrorCode::Unavailable
        | FirestoreErrorCode::Unauthenticated => false,
        FirestoreErrorCode::InvalidArgument
        | FirestoreErrorCode::NotFound
        | FirestoreErrorCode::AlreadyExists
        | FirestoreErrorCode::PermissionDenied
        | FirestoreErrorCode::FailedPrecondition
        | FirestoreErrorCode::Aborted
        | FirestoreErrorCode::OutOfRange
        | FirestoreErrorCode::Unimplemented
        | FirestoreErrorCode::DataLoss => true,
    }
}

/// Writes are retried on `Aborted` (transaction contention) even though the
/// code is otherwise permanent.
pub fn is_permanent_write_error(code: FirestoreErrorCode) -> bool {
    is_permanent_error(code) && code != FirestoreErrorCode::Aborted
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreError {
    pub code: FirestoreErrorCode,
    message: String,
}

impl FirestoreError {
    pub fn new(code: FirestoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for FirestoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for FirestoreError {}

pub type FirestoreResult<T> = Result<T, FirestoreError>;

pub fn cancelled(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Cancelled, message)
}

pub fn unknown(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unknown, message)
}

pub fn invalid_argument(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::InvalidArgument, message)
}

pub fn internal_error(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Internal, message)
}

pub fn not_found(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::PermissionDenied, message)
}

pub fn unauthenticated(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unauthenticated, message)
}

pub fn failed_precondition(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Aborted, message)
}

pub fn unavailable(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::Unavailable, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DeadlineExceeded, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::ResourceExhausted, message)
}

pub fn data_loss(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(FirestoreErrorCode::DataLoss, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_grpc_codes() {
        assert_eq!(
            FirestoreErrorCode::from_grpc_code(8),
            FirestoreErrorCode::ResourceExhausted
        );
        assert_eq!(
            FirestoreErrorCode::from_grpc_code(99),
            FirestoreErrorCode::Unknown
        );
    }

    #[test]
    fn aborted_writes_are_retried() {
        assert!(is_permanent_error(FirestoreErrorCode::Aborted));
        assert!(!is_permanent_write_error(FirestoreErrorCode::Aborted));
        assert!(is_permanent_write_error(FirestoreErrorCode::PermissionDenied));
        assert!(!is_permanent_error(FirestoreErrorCode::Unavailable));
    }

    #[test]
    fn display_includes_code() {
        let err = failed_precondition("lease lost");
        assert_eq!(err.to_string(), "lease lost (firestore/failed-precondition)");
    }
}

//! The closed error set returned by every storage operation.
//!
//! Callers need to tell ordinary outcomes ("chapter full", "past the end")
//! apart from conditions that mean the file can no longer be trusted, so
//! every variant belongs to exactly one [`ErrorClass`].

use std::io;

use thiserror::Error;

use crate::PageId;

/// Coarse classification used by the job layer to build client responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input from the caller. Nothing was changed.
    Caller,
    /// Out of pages, references, memory or time. Speculative work was undone.
    Exhausted,
    /// Offset or id past the end of what exists. Ordinary control flow.
    Boundary,
    /// The file or an in-memory structure violates an invariant.
    Critical,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    Invalid(String),

    #[error("file is not a straitdb datafile")]
    NotDatabase,

    #[error("datafile was written with an incompatible layout: {0}")]
    Incompatible(String),

    #[error("out of space")]
    NoSpace,

    #[error("out of memory while mapping page {0}")]
    NoMemory(PageId),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("end of chapter")]
    Eof,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("critical: {0}")]
    Critical(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Invalid(_) | StoreError::NotDatabase | StoreError::Incompatible(_) => {
                ErrorClass::Caller
            }
            StoreError::NoSpace | StoreError::NoMemory(_) | StoreError::Timeout(_) => {
                ErrorClass::Exhausted
            }
            StoreError::Eof | StoreError::NotFound(_) => ErrorClass::Boundary,
            StoreError::Critical(_) | StoreError::Io(_) => ErrorClass::Critical,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.class() == ErrorClass::Critical
    }

    /// Builds a critical error and logs it at the highest severity.
    pub(crate) fn critical(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        tracing::error!(%msg, "critical storage error");
        StoreError::Critical(msg)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StoreError::Invalid(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn classes_separate_exhaustion_from_critical() {
        assert_eq!(StoreError::NoSpace.class(), ErrorClass::Exhausted);
        assert_eq!(StoreError::Eof.class(), ErrorClass::Boundary);
        assert_eq!(StoreError::NotFound("entry").class(), ErrorClass::Boundary);
        assert_eq!(StoreError::invalid("x").class(), ErrorClass::Caller);
        assert!(StoreError::Critical("bad".into()).is_critical());
        assert!(!StoreError::NoSpace.is_critical());
    }

    #[test]
    fn io_errors_convert_and_are_critical() {
        let err: StoreError = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.is_critical());
    }
}

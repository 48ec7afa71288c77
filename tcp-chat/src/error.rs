use thiserror::Error;

use crate::envelope::OperationType;

/// Failures of the conversation registry. Both are reported back to the
/// client and leave the connection open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("conversation with nickname '{0}' already exists")]
    DuplicateNickname(String),
    #[error("conversation '{0}' does not exist")]
    NotFound(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown operation type '{0}'")]
pub struct UnknownOperationType(pub String);

/// Everything that can go wrong while serving one operation without taking
/// the connection down with it.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("error while unmarshaling {what}, please check again")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Unsupported(#[from] UnknownOperationType),
    #[error("something went wrong")]
    Internal(#[source] serde_json::Error),
}

impl OperationError {
    pub fn malformed(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Malformed { what, source }
    }
}

/// An operation frame that could not be turned into an operation.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RejectedOperation {
    /// Set when the envelope was readable and named a known type.
    pub kind: Option<OperationType>,
    pub error: OperationError,
}

impl RejectedOperation {
    pub fn untyped(error: OperationError) -> Self {
        Self { kind: None, error }
    }
}

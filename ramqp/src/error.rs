use std::fmt;

use serde::{Deserialize, Serialize};

use crate::store::StoreError;

/// Protocol-level close/reply codes the wire layer reports to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    AccessRefused = 403,
    NotFound = 404,
    ResourceLocked = 405,
    PreconditionFailed = 406,
    NotAllowed = 530,
    NotImplemented = 540,
    InternalError = 541,
}

impl ErrorCode {
    #[inline]
    pub fn value(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.value())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("access refused: {0}")]
    AccessRefused(String),
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("Unknown exchange type: {0}")]
    UnknownExchangeType(String),
    #[error("Exchange type {0} is already registered")]
    DuplicateExchangeType(String),
    #[error("Did not find expected exchange type: {0}")]
    MissingExchangeType(String),
    #[error("session {0} is closed")]
    SessionClosed(u64),
    #[error("store failure, {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl BrokerError {
    #[inline]
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        BrokerError::NotFound(what.into())
    }

    #[inline]
    pub fn access_refused<S: Into<String>>(what: S) -> Self {
        BrokerError::AccessRefused(what.into())
    }

    #[inline]
    pub fn precondition_failed<S: Into<String>>(what: S) -> Self {
        BrokerError::PreconditionFailed(what.into())
    }

    #[inline]
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::NotFound(_) => ErrorCode::NotFound,
            BrokerError::AccessRefused(_) => ErrorCode::AccessRefused,
            BrokerError::PreconditionFailed(_) => ErrorCode::PreconditionFailed,
            BrokerError::ResourceLocked(_) => ErrorCode::ResourceLocked,
            BrokerError::NotAllowed(_) | BrokerError::SessionClosed(_) => ErrorCode::NotAllowed,
            BrokerError::UnknownExchangeType(_) => ErrorCode::NotFound,
            BrokerError::DuplicateExchangeType(_) | BrokerError::MissingExchangeType(_) => {
                ErrorCode::InternalError
            }
            BrokerError::Store(_) | BrokerError::Anyhow(_) => ErrorCode::InternalError,
        }
    }

    /// Store failures abort the in-flight operation and are never retried inside the broker.
    #[inline]
    pub fn is_store(&self) -> bool {
        matches!(self, BrokerError::Store(_))
    }
}

use std::io;

use thiserror::Error;

use crate::records::RecordError;
use crate::token::TokenError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("incorrect password")]
    IncorrectPassword,

    #[error("database is corrupted: {0}")]
    Corrupted(String),

    #[error("database name is empty after removing unsupported characters")]
    EmptyName,

    #[error("invalid database name: {0:?}")]
    InvalidName(String),

    #[error("database already exists: {0}")]
    NameTaken(String),

    #[error("account already exists: {0}")]
    AccountExists(String),

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("database not found: {0}")]
    NotFound(String),

    #[error("database is locked: {0}")]
    Locked(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("passwords do not match")]
    PasswordMismatch,

    #[error("invalid archive: {0}")]
    Archive(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("background task failed: {0}")]
    Internal(String),
}

/// Coarse classification handed to whatever drives the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IncorrectPassword,
    Corrupted,
    Validation,
    Io,
    Internal,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::IncorrectPassword => ErrorKind::IncorrectPassword,
            StoreError::Corrupted(_) | StoreError::Archive(_) => ErrorKind::Corrupted,
            StoreError::EmptyName
            | StoreError::InvalidName(_)
            | StoreError::NameTaken(_)
            | StoreError::AccountExists(_)
            | StoreError::AccountNotFound(_)
            | StoreError::NotFound(_)
            | StoreError::Locked(_)
            | StoreError::EmptyPassword
            | StoreError::PasswordMismatch => ErrorKind::Validation,
            StoreError::Io { .. } => ErrorKind::Io,
            StoreError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<TokenError> for StoreError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::InvalidSignature => StoreError::IncorrectPassword,
            other => StoreError::Corrupted(other.to_string()),
        }
    }
}

impl From<RecordError> for StoreError {
    fn from(e: RecordError) -> Self {
        StoreError::Corrupted(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Attaches a human readable context to `std::io` failures.
pub(crate) trait IoContext<T> {
    fn io_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|source| StoreError::Io {
            context: f(),
            source,
        })
    }
}

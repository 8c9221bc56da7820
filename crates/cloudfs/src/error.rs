// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::InodeID;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the inode index, the content cache and
/// their collaborators.
///
/// Each variant belongs to a small closed taxonomy that platform
/// bindings translate into native error codes through [`OsError`].
#[derive(Diagnostic, Debug, Error)]
#[diagnostic(
    url(
        "https://spkenv.dev/error_codes#{}",
        self.code().unwrap_or_else(|| Box::new("cloudfs::generic"))
    )
)]
pub enum Error {
    #[error("No such file or directory: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Is a directory: {0}")]
    IsDirectory(String),
    #[error("Not a directory: {0}")]
    NotDirectory(String),
    #[error("Directory not empty: {0}")]
    NotEmpty(String),
    #[error("Invalid name: {0:?}")]
    InvalidName(String),
    #[error("Name too long: {0:?}")]
    NameTooLong(String),
    #[error("Read-only: {0}")]
    ReadOnly(String),
    #[error("Cache {0} failed: {1}")]
    #[diagnostic(
        code("cloudfs::cache_io"),
        help("Check that the cache directory exists and is writable")
    )]
    Io(&'static str, PathBuf, #[source] io::Error),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Too much contention while trying to {0} inode {1}")]
    #[diagnostic(
        code("cloudfs::contention"),
        help("The directory tree is changing faster than the operation could settle, try again")
    )]
    TooMuchContention(&'static str, InodeID),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("Database error")]
    #[diagnostic(code("cloudfs::database"))]
    Database(#[from] rusqlite::Error),
    #[error("Database at {0} has schema version {1}, which is newer than supported")]
    #[diagnostic(
        code("cloudfs::database_version"),
        help("This database was written by a newer release, upgrade or remove it")
    )]
    DatabaseTooNew(PathBuf, i64),
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error("Invalid path {0}")]
    InvalidPath(PathBuf, #[source] io::Error),
    #[error("Cannot load config, lock has been poisoned: {0}")]
    LockPoisonedRead(String),
    #[error("Cannot update config, lock has been poisoned: {0}")]
    LockPoisonedWrite(String),
}

impl Error {
    /// Build an internal error, asserting in debug builds.
    ///
    /// Invariant violations are programming errors, in release
    /// builds they fail only the operation that detected them.
    pub(crate) fn internal<S: Into<String>>(message: S) -> Self {
        let message = message.into();
        debug_assert!(false, "{message}");
        tracing::error!("invariant violated: {message}");
        Error::Internal(message)
    }

    /// True if retrying the failed operation could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_))
    }
}

/// Errors that can be reported to the operating system as an errno.
pub trait OsError {
    /// The raw os error code that best represents this error, if any
    fn os_error(&self) -> Option<i32>;
}

impl OsError for io::Error {
    fn os_error(&self) -> Option<i32> {
        self.raw_os_error()
    }
}

impl OsError for Error {
    fn os_error(&self) -> Option<i32> {
        match self {
            Error::NotFound(_) => Some(libc::ENOENT),
            Error::AlreadyExists(_) => Some(libc::EEXIST),
            Error::IsDirectory(_) => Some(libc::EISDIR),
            Error::NotDirectory(_) => Some(libc::ENOTDIR),
            Error::NotEmpty(_) => Some(libc::ENOTEMPTY),
            Error::InvalidName(_) => Some(libc::EINVAL),
            Error::NameTooLong(_) => Some(libc::ENAMETOOLONG),
            Error::ReadOnly(_) => Some(libc::EROFS),
            Error::Io(_, _, err) => err.os_error().or(Some(libc::EIO)),
            Error::Cancelled => Some(libc::EINTR),
            Error::TooMuchContention(..) => Some(libc::EAGAIN),
            Error::Network(_) | Error::Internal(_) | Error::Database(_) => Some(libc::EIO),
            _ => None,
        }
    }
}

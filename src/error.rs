//! Error handling for tunepull.
//!
//! Provides a unified error type combining a failure category with the
//! underlying error details. The categories follow the failure taxonomy of
//! the download pipeline:
//!
//! * Resolution failures (catalog metadata could not be fetched)
//! * Fetch failures (the external download tool failed or produced no file)
//! * Filesystem failures (output directories or files could not be created)
//! * Tagging failures (always non-fatal to a download, logged by callers)
//! * Cancellation (not a true error; short-circuits in-flight work)
//!
//! A handful of extra categories (`InvalidArgument`, `Unavailable`,
//! `DeadlineExceeded`, `Unknown`) exist to give conversions from underlying
//! library errors a sensible home.

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Whether this error represents a cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

/// Standard result type for tunepull operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories of the download pipeline.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// Work was cancelled before completion.
    #[error("operation was cancelled")]
    Cancelled,

    /// Catalog metadata lookup failed. Recoverable by retrying the entry.
    #[error("metadata resolution failed")]
    Resolution,

    /// The external download tool exited abnormally or produced no file.
    #[error("track fetch failed")]
    Fetch,

    /// An output directory or file could not be created.
    #[error("filesystem operation failed")]
    Filesystem,

    /// Tag metadata could not be written to a produced file.
    #[error("tag write failed")]
    Tagging,

    /// An argument did not meet validation requirements.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// A remote service or resource is temporarily unreachable.
    #[error("service unavailable")]
    Unavailable,

    /// A time-bound operation exceeded its limit.
    #[error("operation timed out")]
    DeadlineExceeded,

    /// The error doesn't fit any other category.
    #[error("unknown error")]
    Unknown,
}

macro_rules! constructor {
    ($name:ident, $kind:ident) => {
        #[doc = concat!("Creates a new [`ErrorKind::", stringify!($kind), "`] error.")]
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self {
                kind: ErrorKind::$kind,
                error: error.into(),
            }
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    constructor!(cancelled, Cancelled);
    constructor!(resolution, Resolution);
    constructor!(fetch, Fetch);
    constructor!(filesystem, Filesystem);
    constructor!(tagging, Tagging);
    constructor!(invalid_argument, InvalidArgument);
    constructor!(unavailable, Unavailable);
    constructor!(deadline_exceeded, DeadlineExceeded);
    constructor!(unknown, Unknown);
}

/// Returns the underlying error source.
///
/// This allows error chains to be examined for root causes.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
///
/// Most IO failures in this crate come from creating output directories and
/// files, so the default mapping is `Filesystem`. Interruptions and timeouts
/// keep their logical equivalents.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            Interrupted => Self::cancelled(err),
            TimedOut => Self::deadline_exceeded(err),
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected => {
                Self::unavailable(err)
            }
            InvalidInput | InvalidData => Self::invalid_argument(err),
            _ => Self::filesystem(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::unknown(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        Self::unavailable(err)
    }
}

/// Converts JSON errors to `InvalidArgument`.
///
/// JSON parsing in this crate only happens on external tool output, so a
/// parse failure means the tool handed us something malformed.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_argument(err)
    }
}

/// Converts TOML deserialization errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts TOML serialization errors to `Unknown`.
impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Self::unknown(e)
    }
}

/// Converts URL parsing errors to `InvalidArgument`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

/// Converts task join errors into appropriate error kinds.
///
/// An aborted task maps to `Cancelled`; a panicked task to `Unknown`.
impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Self::cancelled(e)
        } else {
            Self::unknown(e)
        }
    }
}

/// Converts tag read/write errors to `Tagging`.
impl From<lofty::error::LoftyError> for Error {
    fn from(e: lofty::error::LoftyError) -> Self {
        Self::tagging(e)
    }
}

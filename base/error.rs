// This file is part of Moonfire Presence, a face recognition room occupancy tracker.
// Copyright (C) 2024 The Moonfire Presence Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Coded error type used throughout the server.
//!
//! Errors carry an [`ErrorKind`] (for mapping to HTTP status codes and the
//! like), an optional human-readable message, and an optional source chain.
//! Use the [`crate::err!`] and [`crate::bail!`] macros to construct them.

use std::error::Error as StdError;
use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link
/// for descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Cancelled => "Cancelled",
            Unknown => "Unknown",
            InvalidArgument => "Invalid argument",
            DeadlineExceeded => "Deadline exceeded",
            NotFound => "Not found",
            AlreadyExists => "Already exists",
            PermissionDenied => "Permission denied",
            Unauthenticated => "Unauthenticated",
            ResourceExhausted => "Resource exhausted",
            FailedPrecondition => "Failed precondition",
            Aborted => "Aborted",
            OutOfRange => "Out of range",
            Unimplemented => "Unimplemented",
            Internal => "Internal",
            Unavailable => "Unavailable",
            DataLoss => "Data loss",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

/// An error with a code, optional message, and optional source.
///
/// Boxed so that `Result<T, Error>` stays a pointer wide on the happy path.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns an object which displays the full chain of causes, separated
    /// by `: `, as in `unable to open camera: connection refused`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.msg {
            Some(ref m) => f.write_str(m),
            None => match self.0.source {
                Some(ref s) => write!(f, "{}: {}", self.0.kind, s),
                None => f.write_str(self.0.kind.as_str()),
            },
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.0.kind, self.chain())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

/// Displays an [`Error`] along with its full cause chain.
pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut cur: Option<&(dyn StdError + 'static)> = self.0.source();
        while let Some(e) = cur {
            write!(f, ": {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

/// Step-by-step builder used by the [`crate::err!`] macro.
pub struct ErrorBuilder(Box<ErrorInner>);

impl ErrorBuilder {
    pub fn new(kind: ErrorKind) -> Self {
        ErrorBuilder(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    pub fn msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn source<S: Into<Box<dyn StdError + Send + Sync>>>(mut self, source: S) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(self.0)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IK;
        let kind = match e.kind() {
            IK::NotFound => ErrorKind::NotFound,
            IK::PermissionDenied => ErrorKind::PermissionDenied,
            IK::AlreadyExists => ErrorKind::AlreadyExists,
            IK::InvalidInput | IK::InvalidData => ErrorKind::InvalidArgument,
            IK::TimedOut => ErrorKind::DeadlineExceeded,
            IK::Interrupted => ErrorKind::Aborted,
            _ => ErrorKind::Unknown,
        };
        ErrorBuilder::new(kind).source(e).build()
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::ConstraintViolation) => ErrorKind::AlreadyExists,
            _ => ErrorKind::Internal,
        };
        ErrorBuilder::new(kind).source(e).build()
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, discarding the prior kind but
    /// keeping it in the source chain.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<Box<dyn StdError + Send + Sync>>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| ErrorBuilder::new(k).source(e).build())
    }
}

/// Constructs an [`Error`] from an [`ErrorKind`] and optional `msg(...)` and
/// `source(...)` clauses, in that order.
///
/// ```
/// use moonfire_base::{err, ErrorKind};
/// let e = err!(NotFound, msg("no such camera {}", 3));
/// assert_eq!(e.kind(), ErrorKind::NotFound);
/// assert_eq!(e.to_string(), "no such camera 3");
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind).build()
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .build()
    };
    ($kind:ident, source($source:expr)) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .source($source)
            .build()
    };
    ($kind:ident, msg($($msg:tt)*), source($source:expr) $(,)?) => {
        $crate::ErrorBuilder::new($crate::ErrorKind::$kind)
            .msg(format!($($msg)*))
            .source($source)
            .build()
    };
}

/// Returns early with an error built as by [`crate::err!`].
#[macro_export]
macro_rules! bail {
    ($($t:tt)*) => {
        return Err($crate::err!($($t)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_forms() {
        let e = crate::err!(Unavailable);
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert_eq!(e.to_string(), "Unavailable");

        let e = crate::err!(InvalidArgument, msg("bad scheme {:?}", "http"));
        assert_eq!(e.kind(), ErrorKind::InvalidArgument);
        assert_eq!(e.to_string(), "bad scheme \"http\"");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let e = crate::err!(Internal, msg("save failed"), source(io));
        assert_eq!(e.to_string(), "save failed");
        assert_eq!(e.chain().to_string(), "save failed: boom");
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            crate::bail!(NotFound, msg("nope"));
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn io_kind_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }
}

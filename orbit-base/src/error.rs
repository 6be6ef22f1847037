// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// Coarse classification an `Error` carries alongside its opaque
/// backtrace, so callers that need to distinguish "not found" from any
/// other failure (e.g. mapping to an HTTP status) don't have to
/// string-match the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    Other,
    NotFound,
    Conflict,
}

#[derive(Debug)]
pub struct Error {
    inner: DynBacktraceError,
    kind: ErrorKind,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::new(err)
    }
}

impl Error {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        error!(target: "orbit", "{:?}", err);
        let dbe = DynBacktraceError::from(err);
        Error { inner: dbe, kind: ErrorKind::Other }
    }

    /// An error whose cause is "the entity wasn't there", e.g. a store
    /// lookup by id that came back empty. Lets callers at the API
    /// boundary map this to 404 without re-deriving it from the message.
    pub fn not_found(msg: impl Into<Cow<'static, str>>) -> Error {
        let mut e = Error::new(SimpleErr(msg.into()));
        e.kind = ErrorKind::NotFound;
        e
    }

    /// An error whose cause is "the request conflicts with the current
    /// state", e.g. a queue rejecting a push past its capacity. Lets
    /// callers at the API boundary map this to 409 instead of 500.
    pub fn conflict(msg: impl Into<Cow<'static, str>>) -> Error {
        let mut e = Error::new(SimpleErr(msg.into()));
        e.kind = ErrorKind::Conflict;
        e
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }
}

pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::new(err)
}

#[test]
fn test_error() {
    let _err = err("test error");
}

pub use anyhow::Result;

use serde::Serialize;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};

/// Stable error categories, surfaced to hosts as the `type` field of the
/// `{type, message}` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, strum::AsRefStr, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    QueryParsing,
    QuerySyntax,
    UserInit,
    Runtime,
    IoHandling,
}

/// The one error type crossing the public boundary.
#[derive(Clone, Serialize)]
pub struct Error {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn parsing(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::QueryParsing, message)
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::QuerySyntax, message)
    }

    pub fn user_init(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::UserInit, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Runtime, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::IoHandling, message)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

// Needed for anyhow
impl StdError for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A field access beyond the end of a record. Internal: the executor
/// converts it into the user-facing `No "a3" field at record N` message.
#[derive(Debug, Clone)]
pub(crate) struct BadFieldError {
    pub prefix: char,
    pub index: usize,
}

impl StdError for BadFieldError {}

impl Display for BadFieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "no \"{}{}\" field", self.prefix, self.index + 1)
    }
}

/// Reduce an internal `anyhow::Error` to the structured boundary error.
/// Anything that is not already an [Error] becomes `runtime`; in debug
/// mode the full chain (and backtrace) is preserved.
pub fn downcast(error: anyhow::Error) -> Error {
    let error = match error.downcast::<Error>() {
        Ok(e) => return e,
        Err(error) => error,
    };
    let message = if crate::debug_mode() {
        format!("{error:?}")
    } else {
        format!("{error:#}")
    };
    Error::new(ErrorKind::Runtime, message)
}

//! Normalized application error.
//!
//! Every fallible operation in the system resolves to an [`AppError`] at the
//! signaling boundary: a stable machine-readable code, a human message, an
//! HTTP-equivalent severity class, and an `is_operational` flag separating
//! expected failures (bad input, missing resource, full room) from
//! unexpected ones (bugs, vendor outages). Handlers log the error once with
//! correlation context; callers receive a structured failure, never an
//! uncaught panic.

use std::error::Error as StdError;
use std::fmt;

/// Fallback message shown to callers for non-operational failures outside
/// development mode.
const MASKED_MESSAGE: &str = "Internal server error";

/// A normalized application error.
#[derive(Debug)]
pub struct AppError {
    code: &'static str,
    message: String,
    status: u16,
    is_operational: bool,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl AppError {
    /// Malformed or missing required fields; rejected before side effects.
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: 400,
            is_operational: true,
            source: None,
        }
    }

    /// A referenced room/user/transport/track does not exist.
    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: 404,
            is_operational: true,
            source: None,
        }
    }

    /// A soft business failure (e.g. room full). Expected, not logged as an
    /// incident.
    pub fn capacity(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: 409,
            is_operational: true,
            source: None,
        }
    }

    /// A worker/router/vendor dependency failed; the original cause is
    /// preserved for logging.
    pub fn upstream(
        code: &'static str,
        message: impl Into<String>,
        cause: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            status: 502,
            is_operational: false,
            source: Some(Box::new(cause)),
        }
    }

    /// An unexpected internal failure.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "INTERNAL_ERROR",
            message: message.into(),
            status: 500,
            is_operational: false,
            source: None,
        }
    }

    /// Overrides the stable error code.
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = code;
        self
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    /// HTTP-equivalent severity class.
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_operational(&self) -> bool {
        self.is_operational
    }

    /// The full internal message, for logs.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The message surfaced to the caller.
    ///
    /// Operational failures return their real message; non-operational
    /// failures are masked unless the server runs in development mode.
    pub fn public_message(&self, dev_mode: bool) -> &str {
        if self.is_operational || dev_mode {
            &self.message
        } else {
            MASKED_MESSAGE
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

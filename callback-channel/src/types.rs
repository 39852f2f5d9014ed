//! Core types for the callback channel
//!
//! This module defines the handle, value and request types that travel through
//! the channel, plus the error types shared by the whole library.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type used throughout the channel
pub type Timestamp = DateTime<Utc>;

/// Argument value passed to a callback
///
/// null, boolean, number, string, sequence or string-keyed map, recursively.
pub type Value = serde_json::Value;

/// Result type for channel operations
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Result returned by a callback body
pub type CallbackResult = std::result::Result<(), CallbackError>;

/// Opaque identifier of a callback registered in the consumer context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallbackHandle(pub u64);

impl CallbackHandle {
    /// Raw integer value of the handle
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CallbackHandle {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single pending callback invocation
///
/// Built by a producer at enqueue time and consumed exactly once by the
/// dispatcher, either delivered or reported.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    /// Callback to invoke
    pub handle: CallbackHandle,
    /// Arguments, in call order
    pub args: Vec<Value>,
    /// When the producer placed the request in the channel
    pub enqueued_at: Timestamp,
}

impl InvocationRequest {
    /// Create a request stamped with the current time
    pub fn new(handle: CallbackHandle, args: Vec<Value>) -> Self {
        Self {
            handle,
            args,
            enqueued_at: Utc::now(),
        }
    }

    /// Milliseconds this request has been waiting, as of `now`
    pub fn wait_time_ms(&self, now: Timestamp) -> i64 {
        (now - self.enqueued_at).num_milliseconds().max(0)
    }
}

/// Errors returned to producers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel closed: callback {0} was not enqueued")]
    ChannelClosed(CallbackHandle),

    #[error("Queue full: {depth} pending requests (limit: {limit})")]
    QueueFull { depth: usize, limit: usize },

    #[error("Value cannot be passed to a callback: {0}")]
    UnsupportedValue(String),
}

/// Failure raised by a callback body
///
/// Carries an optional cause so nested failures can be rendered as one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    /// Short classification (e.g. `"Panic"`, `"IoError"`)
    pub kind: String,
    /// Human readable message
    pub message: String,
    /// Underlying failure, if any
    pub cause: Option<Box<CallbackError>>,
}

impl CallbackError {
    /// Create a plain callback error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: "CallbackError".to_string(),
            message: message.into(),
            cause: None,
        }
    }

    /// Create an error with an explicit kind
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause
    pub fn caused_by(mut self, cause: CallbackError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build a callback error from any std error, keeping its source chain
    pub fn from_std(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut root = Self::with_kind("Error", error.to_string());
        if let Some(source) = error.source() {
            root.cause = Some(Box::new(Self::from_std(source)));
        }
        root
    }

    /// Error describing a panic payload caught during dispatch
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked".to_string()
        };
        Self::with_kind("Panic", message)
    }

    /// Render the error and every cause, one per line
    pub fn all_messages(&self) -> String {
        let mut out = format!("{}: {}", self.kind, self.message);
        let mut cause = self.cause.as_deref();
        while let Some(c) = cause {
            out.push_str("\nCaused by: ");
            out.push_str(&format!("{}: {}", c.kind, c.message));
            cause = c.cause.as_deref();
        }
        out
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

/// Convert any serializable value into a callback argument
pub fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| ChannelError::UnsupportedValue(e.to_string()))
}

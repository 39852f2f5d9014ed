//! Delivery diagnostics
//!
//! Requests that cannot be delivered are never raised on the consumer thread.
//! They are reported to a [`DiagnosticSink`] instead.

use crate::types::{CallbackError, CallbackHandle, Timestamp};
use chrono::Utc;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Why a request was not delivered successfully
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticKind {
    /// The handle was never registered or has been released
    UnresolvedHandle,
    /// The callback ran and failed (returned an error or panicked)
    CallbackFailed(CallbackError),
    /// The channel was torn down before the request was delivered
    Cancelled,
}

/// One report about one request
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Handle of the affected request
    pub handle: CallbackHandle,
    /// Number of arguments the request carried
    pub arg_count: usize,
    /// What went wrong
    pub kind: DiagnosticKind,
    /// When the dispatcher produced the report
    pub reported_at: Timestamp,
}

impl Diagnostic {
    pub fn new(handle: CallbackHandle, arg_count: usize, kind: DiagnosticKind) -> Self {
        Self {
            handle,
            arg_count,
            kind,
            reported_at: Utc::now(),
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self.kind, DiagnosticKind::UnresolvedHandle)
    }

    pub fn is_callback_failure(&self) -> bool {
        matches!(self.kind, DiagnosticKind::CallbackFailed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, DiagnosticKind::Cancelled)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            DiagnosticKind::UnresolvedHandle => write!(
                f,
                "unresolved callback {} ({} args): handle is not registered",
                self.handle, self.arg_count
            ),
            DiagnosticKind::CallbackFailed(error) => write!(
                f,
                "callback {} failed: {}",
                self.handle,
                error.all_messages()
            ),
            DiagnosticKind::Cancelled => write!(
                f,
                "callback {} cancelled: channel closed before delivery",
                self.handle
            ),
        }
    }
}

/// Receiver of delivery diagnostics
pub trait DiagnosticSink {
    fn report(&mut self, diagnostic: Diagnostic);
}

impl<F> DiagnosticSink for F
where
    F: FnMut(Diagnostic),
{
    fn report(&mut self, diagnostic: Diagnostic) {
        self(diagnostic)
    }
}

/// Sink that writes every diagnostic to the log at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        log::warn!("{}", diagnostic);
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn report(&mut self, _diagnostic: Diagnostic) {}
}

/// Sink that keeps diagnostics in memory
///
/// Clones share the same storage, so one clone can be handed to the
/// dispatcher while another is inspected.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    entries: Arc<Mutex<Vec<Diagnostic>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything reported so far
    pub fn snapshot(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return everything reported so far
    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }
}

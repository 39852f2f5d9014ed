//! Named event emission
//!
//! The consumer context registers one emit callback; native code sends named
//! events through it as `[eventName, body]` invocations. Listener bookkeeping
//! lets producers skip work nobody is subscribed to.

use crate::channel::CallbackSender;
use crate::types::{to_value, CallbackHandle, ChannelError, Value};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Errors raised by the event emitter
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EmitterError {
    #[error("Event {0} is not supported")]
    UnsupportedEvent(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Counts from [`EventEmitter::forward_while_listening`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardSummary {
    pub sent: usize,
    /// Values produced while nobody was listening
    pub skipped: usize,
}

/// Sends named events to a single emit callback
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: CallbackSender,
    emit_handle: CallbackHandle,
    supported_events: Arc<BTreeSet<String>>,
    listeners: Arc<AtomicUsize>,
}

impl EventEmitter {
    /// Create an emitter for the given event names
    pub fn new<I, S>(sender: CallbackSender, emit_handle: CallbackHandle, supported_events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sender,
            emit_handle,
            supported_events: Arc::new(supported_events.into_iter().map(Into::into).collect()),
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Names this emitter accepts
    pub fn supported_events(&self) -> impl Iterator<Item = &str> {
        self.supported_events.iter().map(String::as_str)
    }

    pub fn is_supported(&self, event_name: &str) -> bool {
        self.supported_events.contains(event_name)
    }

    fn check_supported(&self, event_name: &str) -> Result<(), EmitterError> {
        if self.is_supported(event_name) {
            Ok(())
        } else {
            Err(EmitterError::UnsupportedEvent(event_name.to_string()))
        }
    }

    /// Record a new listener for `event_name`
    pub fn add_listener(&self, event_name: &str) -> Result<(), EmitterError> {
        self.check_supported(event_name)?;
        let count = self.listeners.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Listener added for {} ({} total)", event_name, count);
        Ok(())
    }

    /// Drop `count` listeners; the total never goes below zero
    pub fn remove_listeners(&self, count: usize) {
        let previous = self
            .listeners
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(count)))
            .unwrap_or(0);
        log::debug!(
            "Removed {} listeners ({} remaining)",
            count,
            previous.saturating_sub(count)
        );
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }

    /// Send an event; a missing body is sent as an empty map
    pub fn send_event(&self, event_name: &str, body: Option<Value>) -> Result<(), EmitterError> {
        self.check_supported(event_name)?;
        let body = body.unwrap_or_else(|| Value::Object(Default::default()));
        self.sender
            .enqueue(self.emit_handle, vec![Value::String(event_name.to_string()), body])?;
        Ok(())
    }

    /// Send an event with any serializable body
    pub fn send_event_json<T: Serialize>(&self, event_name: &str, body: &T) -> Result<(), EmitterError> {
        let body = to_value(body)?;
        self.send_event(event_name, Some(body))
    }

    /// Send only while someone is listening
    ///
    /// Returns whether the event was sent.
    pub fn send_if_listening(&self, event_name: &str, body: Option<Value>) -> Result<bool, EmitterError> {
        if !self.has_listeners() {
            log::trace!("No listeners, skipping event {}", event_name);
            return Ok(false);
        }
        self.send_event(event_name, body)?;
        Ok(true)
    }

    /// Stream values as events for as long as the source yields them
    ///
    /// Listener presence is checked per value. Values produced while nobody
    /// listens are dropped rather than buffered, and streaming resumes with
    /// the next value once a listener is added again.
    pub fn forward_while_listening<I, T>(&self, event_name: &str, values: I) -> Result<ForwardSummary, EmitterError>
    where
        I: IntoIterator<Item = T>,
        T: Serialize,
    {
        self.check_supported(event_name)?;

        let mut summary = ForwardSummary::default();
        for value in values {
            if !self.has_listeners() {
                summary.skipped += 1;
                continue;
            }
            self.send_event_json(event_name, &value)?;
            summary.sent += 1;
        }

        log::debug!(
            "Forwarded {} {} events ({} skipped without listeners)",
            summary.sent,
            event_name,
            summary.skipped
        );
        Ok(summary)
    }
}

//! Channel configuration types
//!
//! The channel needs very little configuration: an optional queue bound and
//! whether diagnostics should also be written to the log.

use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;

/// Configuration for a callback channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Maximum number of pending requests (None = unbounded)
    ///
    /// A zero bound would refuse every request, so it fails to deserialize.
    #[serde(default)]
    pub capacity: Option<NonZeroUsize>,

    /// Whether the default diagnostics sink writes to the log
    #[serde(default = "default_true")]
    pub log_diagnostics: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            log_diagnostics: true,
        }
    }
}

impl ChannelConfig {
    /// Create a new channel configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: bound the queue to `capacity` pending requests
    ///
    /// A capacity of 0 leaves the queue unbounded.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = NonZeroUsize::new(capacity);
        self
    }

    /// Builder method: remove any queue bound
    pub fn unbounded(mut self) -> Self {
        self.capacity = None;
        self
    }

    /// Builder method: enable or disable diagnostic logging
    pub fn with_log_diagnostics(mut self, enabled: bool) -> Self {
        self.log_diagnostics = enabled;
        self
    }

    /// The queue bound as a plain count, if any
    pub fn limit(&self) -> Option<usize> {
        self.capacity.map(NonZeroUsize::get)
    }

    /// Check whether one more request fits next to `depth` pending ones
    pub fn admits(&self, depth: usize) -> bool {
        match self.limit() {
            Some(limit) => depth < limit,
            None => true,
        }
    }
}

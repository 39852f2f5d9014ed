//! State subscriptions
//!
//! The consumer context polls a piece of native state with "give me the next
//! value that differs from what I already have". Each poll carries a
//! subscription id, the JSON it last saw, and a [`Promise`]. The promise
//! settles once the state serializes to something different. Only the newest
//! poll per subscription id is kept; a newer one cancels the older.

use crate::promise::{Promise, UserInfo};
use crate::types::{ChannelError, Result, Timestamp, Value};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Rejection message for polls replaced by a newer one or unsubscribed
pub const CANCELLATION_MESSAGE: &str = "State subscription cancelled";

/// How long a poll may wait before [`StateSubscriptions::expire_stale`] settles it
pub const DEFAULT_POLL_TIMEOUT_MINUTES: i64 = 10;

struct PendingPoll {
    invocation: u64,
    previous: Option<String>,
    promise: Promise,
    subscribed_at: Timestamp,
}

#[derive(Default)]
struct StateTable {
    current: Option<String>,
    pending: HashMap<String, PendingPoll>,
    next_invocation: u64,
}

enum Settlement {
    Changed(String),
    Cancelled,
    Expired(Option<String>, i64),
}

/// Latest-value state with per-subscription pending polls
///
/// Cloning shares the same state, so the producer that publishes and the
/// bridge that subscribes can each hold a copy.
#[derive(Clone, Default)]
pub struct StateSubscriptions {
    table: Arc<Mutex<StateTable>>,
}

impl StateSubscriptions {
    /// Create an empty state; polls wait until the first publish
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state that already holds `value`
    pub fn with_initial<T: Serialize>(value: &T) -> Result<Self> {
        let state = Self::new();
        state.publish(value)?;
        Ok(state)
    }

    fn lock(&self) -> MutexGuard<'_, StateTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The serialized current state, if anything was published
    pub fn current(&self) -> Option<String> {
        self.lock().current.clone()
    }

    /// Number of polls waiting for a change
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Poll for the next state that differs from `previous`
    ///
    /// Resolves right away if the current state already differs. Otherwise
    /// the poll waits for a [`publish`](Self::publish). Any older poll under
    /// the same `subscription_id` is rejected with [`CANCELLATION_MESSAGE`].
    /// Returns the invocation number assigned to this poll.
    pub fn subscribe(
        &self,
        subscription_id: impl Into<String>,
        previous: Option<String>,
        promise: Promise,
    ) -> u64 {
        let subscription_id = subscription_id.into();
        let mut settle_now = Vec::with_capacity(2);

        let invocation = {
            let mut table = self.lock();
            table.next_invocation += 1;
            let invocation = table.next_invocation;

            if let Some(replaced) = table.pending.remove(&subscription_id) {
                log::debug!(
                    "Poll {} for {} replaced by {}",
                    replaced.invocation,
                    subscription_id,
                    invocation
                );
                settle_now.push((replaced.promise, Settlement::Cancelled));
            }

            let changed = match &table.current {
                Some(current) if previous.as_ref() != Some(current) => Some(current.clone()),
                _ => None,
            };
            match changed {
                Some(current) => settle_now.push((promise, Settlement::Changed(current))),
                None => {
                    table.pending.insert(
                        subscription_id,
                        PendingPoll {
                            invocation,
                            previous,
                            promise,
                            subscribed_at: Utc::now(),
                        },
                    );
                }
            }
            invocation
        };

        for (promise, settlement) in settle_now {
            settle(promise, settlement);
        }
        invocation
    }

    /// Replace the current state and settle every poll it differs from
    ///
    /// Returns the number of polls resolved.
    pub fn publish<T: Serialize>(&self, value: &T) -> Result<usize> {
        let json =
            serde_json::to_string(value).map_err(|e| ChannelError::UnsupportedValue(e.to_string()))?;

        let changed: Vec<PendingPoll> = {
            let mut table = self.lock();
            table.current = Some(json.clone());
            let ids: Vec<String> = table
                .pending
                .iter()
                .filter(|(_, poll)| poll.previous.as_ref() != Some(&json))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.pending.remove(id)).collect()
        };

        let resolved = changed.len();
        for poll in changed {
            settle(poll.promise, Settlement::Changed(json.clone()));
        }
        log::trace!("Published state, {} polls resolved", resolved);
        Ok(resolved)
    }

    /// Drop the pending poll for `subscription_id`, rejecting its promise
    ///
    /// Returns false if nothing was pending under that id.
    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        let removed = self.lock().pending.remove(subscription_id);
        match removed {
            Some(poll) => {
                settle(poll.promise, Settlement::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Settle polls that have waited at least `max_age`
    ///
    /// An expired poll resolves with its own `previous` value, so the caller
    /// simply polls again. A poll without a previous value is rejected,
    /// since the state never produced anything to hand back.
    pub fn expire_older_than(&self, max_age: chrono::Duration) -> usize {
        let now = Utc::now();
        let expired: Vec<PendingPoll> = {
            let mut table = self.lock();
            let ids: Vec<String> = table
                .pending
                .iter()
                .filter(|(_, poll)| now - poll.subscribed_at >= max_age)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| table.pending.remove(id)).collect()
        };

        let count = expired.len();
        for poll in expired {
            settle(poll.promise, Settlement::Expired(poll.previous, max_age.num_minutes()));
        }
        count
    }

    /// [`expire_older_than`](Self::expire_older_than) with the default timeout
    pub fn expire_stale(&self) -> usize {
        self.expire_older_than(chrono::Duration::minutes(DEFAULT_POLL_TIMEOUT_MINUTES))
    }
}

impl std::fmt::Debug for StateSubscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.lock();
        f.debug_struct("StateSubscriptions")
            .field("current", &table.current)
            .field("pending", &table.pending.len())
            .finish()
    }
}

fn settle(promise: Promise, settlement: Settlement) {
    let result = match settlement {
        Settlement::Changed(json) => promise.resolve(Value::String(json)),
        Settlement::Cancelled => promise.reject_with(CANCELLATION_MESSAGE, UserInfo::new()),
        Settlement::Expired(Some(previous), _) => promise.resolve(Value::String(previous)),
        Settlement::Expired(None, minutes) => promise.reject_with(
            format!(
                "State did not produce a value within {} minutes; it may not represent a state",
                minutes
            ),
            UserInfo::new(),
        ),
    };
    if let Err(e) = result {
        log::warn!("Could not settle state poll: {}", e);
    }
}

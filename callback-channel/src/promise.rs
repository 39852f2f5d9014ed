//! Promise helpers
//!
//! A bridged async method receives two callback handles from the consumer
//! context: one to resolve and one to reject. [`Promise`] pairs them with a
//! sender so native code can settle the call from whichever thread finishes
//! the work. Settling consumes the promise, so at most one of the two
//! callbacks is ever enqueued.

use crate::channel::CallbackSender;
use crate::types::{to_value, CallbackHandle, Result, Value};
use serde::Serialize;
use serde_json::Map;
use std::sync::Arc;

/// Extra data attached to a rejection, keyed by field name
pub type UserInfo = Map<String, Value>;

/// Maps an error to the `userInfo` payload sent along with a rejection
pub type ErrorInterceptor = Arc<dyn Fn(&(dyn std::error::Error + 'static)) -> UserInfo + Send + Sync>;

fn empty_user_info(_error: &(dyn std::error::Error + 'static)) -> UserInfo {
    UserInfo::new()
}

/// A pending resolve/reject pair
///
/// Not `Clone`: settling takes the only instance, so a promise cannot be
/// both resolved and rejected.
///
/// ```compile_fail
/// use callback_channel::{CallbackHandle, CallbackRegistry, ChannelConfig, Dispatcher, Promise};
///
/// let dispatcher = Dispatcher::new(ChannelConfig::new(), CallbackRegistry::new());
/// let promise = Promise::new(dispatcher.sender(), CallbackHandle(1), CallbackHandle(2));
/// promise.resolve(serde_json::Value::Null).unwrap();
/// promise.reject_with("late", Default::default()).unwrap();
/// ```
pub struct Promise {
    sender: CallbackSender,
    resolve_handle: CallbackHandle,
    reject_handle: CallbackHandle,
    interceptor: ErrorInterceptor,
}

impl Promise {
    /// Create a promise from the two handles supplied by the caller
    pub fn new(
        sender: CallbackSender,
        resolve_handle: CallbackHandle,
        reject_handle: CallbackHandle,
    ) -> Self {
        Self {
            sender,
            resolve_handle,
            reject_handle,
            interceptor: Arc::new(empty_user_info),
        }
    }

    /// Build a promise from a bridged argument list
    ///
    /// Bridged async methods receive the resolve and reject handles as the
    /// last two arguments. Returns the promise and the remaining arguments,
    /// or `None` if the trailing two values are not handles.
    pub fn from_trailing_args(sender: CallbackSender, mut args: Vec<Value>) -> Option<(Self, Vec<Value>)> {
        if args.len() < 2 {
            return None;
        }
        let reject = args.pop()?.as_u64()?;
        let resolve = args.pop()?.as_u64()?;
        Some((
            Self::new(sender, CallbackHandle(resolve), CallbackHandle(reject)),
            args,
        ))
    }

    /// Builder method: compute rejection `userInfo` with `interceptor`
    pub fn with_interceptor<F>(mut self, interceptor: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + 'static)) -> UserInfo + Send + Sync + 'static,
    {
        self.interceptor = Arc::new(interceptor);
        self
    }

    pub fn resolve_handle(&self) -> CallbackHandle {
        self.resolve_handle
    }

    pub fn reject_handle(&self) -> CallbackHandle {
        self.reject_handle
    }

    /// Resolve with a value
    pub fn resolve(self, value: Value) -> Result<()> {
        log::trace!("Resolving promise via {}", self.resolve_handle);
        self.sender.enqueue(self.resolve_handle, vec![value])
    }

    /// Resolve with any serializable value
    pub fn resolve_json<T: Serialize>(self, value: &T) -> Result<()> {
        let value = to_value(value)?;
        self.resolve(value)
    }

    /// Reject with an error
    ///
    /// The reject callback receives one map argument with `message` and
    /// `userInfo` fields.
    pub fn reject(self, error: &(dyn std::error::Error + 'static)) -> Result<()> {
        let user_info = (self.interceptor)(error);
        self.reject_with(error.to_string(), user_info)
    }

    /// Reject with an explicit message and user info
    pub fn reject_with(self, message: impl Into<String>, user_info: UserInfo) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("message".to_string(), Value::String(message.into()));
        payload.insert("userInfo".to_string(), Value::Object(user_info));

        log::trace!("Rejecting promise via {}", self.reject_handle);
        self.sender
            .enqueue(self.reject_handle, vec![Value::Object(payload)])
    }

    /// Settle from a result: serialize `Ok` and resolve, or reject with `Err`
    ///
    /// A value that fails to serialize rejects the promise instead.
    pub fn settle<T, E>(self, result: std::result::Result<T, E>) -> Result<()>
    where
        T: Serialize,
        E: std::error::Error + 'static,
    {
        match result {
            Ok(value) => match serde_json::to_value(&value) {
                Ok(value) => self.resolve(value),
                Err(e) => self.reject(&e),
            },
            Err(e) => self.reject(&e),
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("resolve_handle", &self.resolve_handle)
            .field("reject_handle", &self.reject_handle)
            .finish()
    }
}

//! Callback registry
//!
//! Maps opaque handles to the callables that live in the consumer context.
//! The dispatcher only talks to the registry through [`CallbackResolver`], and
//! only at delivery time.

use crate::types::{CallbackHandle, CallbackResult, Value};
use std::collections::HashMap;

/// A callback that may run any number of times
pub type CallbackFn = Box<dyn FnMut(Vec<Value>) -> CallbackResult>;

/// A callback that runs at most once
pub type OnceCallbackFn = Box<dyn FnOnce(Vec<Value>) -> CallbackResult>;

/// A registered callable
pub enum Callback {
    /// Stays registered until released
    Persistent(CallbackFn),
    /// Released automatically the first time it is resolved
    OneShot(OnceCallbackFn),
}

impl Callback {
    /// Wrap a reusable closure
    pub fn persistent<F>(f: F) -> Self
    where
        F: FnMut(Vec<Value>) -> CallbackResult + 'static,
    {
        Callback::Persistent(Box::new(f))
    }

    /// Wrap a closure that fires once
    pub fn one_shot<F>(f: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> CallbackResult + 'static,
    {
        Callback::OneShot(Box::new(f))
    }

    /// True if the callback is released after its first resolution
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Callback::OneShot(_))
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callback::Persistent(_) => write!(f, "Callback::Persistent"),
            Callback::OneShot(_) => write!(f, "Callback::OneShot"),
        }
    }
}

/// Outcome of a successful handle lookup
pub enum ResolvedCallback<'a> {
    /// Borrowed from the registry, stays registered
    Persistent(&'a mut CallbackFn),
    /// Taken out of the registry
    OneShot(OnceCallbackFn),
}

impl ResolvedCallback<'_> {
    /// Run the callback with the given arguments
    pub fn invoke(self, args: Vec<Value>) -> CallbackResult {
        match self {
            ResolvedCallback::Persistent(f) => f(args),
            ResolvedCallback::OneShot(f) => f(args),
        }
    }
}

/// Lookup of live callbacks by handle
pub trait CallbackResolver {
    /// Resolve a handle, or `None` if it was never registered or already released
    fn resolve(&mut self, handle: CallbackHandle) -> Option<ResolvedCallback<'_>>;
}

/// In-process registry of callbacks keyed by handle
#[derive(Debug)]
pub struct CallbackRegistry {
    callbacks: HashMap<CallbackHandle, Callback>,
    /// Next handle to issue
    next_id: u64,
}

impl CallbackRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Register a reusable callback and return its handle
    pub fn register<F>(&mut self, f: F) -> CallbackHandle
    where
        F: FnMut(Vec<Value>) -> CallbackResult + 'static,
    {
        self.add(Callback::persistent(f))
    }

    /// Register a callback that is released after it fires once
    pub fn register_once<F>(&mut self, f: F) -> CallbackHandle
    where
        F: FnOnce(Vec<Value>) -> CallbackResult + 'static,
    {
        self.add(Callback::one_shot(f))
    }

    /// Register an already wrapped callback under a fresh handle
    pub fn add(&mut self, callback: Callback) -> CallbackHandle {
        let handle = CallbackHandle(self.next_id);
        self.next_id += 1;
        log::trace!("Registered callback {} ({:?})", handle, callback);
        self.callbacks.insert(handle, callback);
        handle
    }

    /// Register a callback under a caller-chosen handle
    ///
    /// Returns the callback previously stored under that handle, if any.
    /// Handles issued afterwards never collide with `handle`.
    pub fn insert(&mut self, handle: CallbackHandle, callback: Callback) -> Option<Callback> {
        if handle.0 >= self.next_id {
            self.next_id = handle.0 + 1;
        }
        self.callbacks.insert(handle, callback)
    }

    /// Release a callback; returns false if the handle was not live
    pub fn release(&mut self, handle: CallbackHandle) -> bool {
        let removed = self.callbacks.remove(&handle).is_some();
        if removed {
            log::trace!("Released callback {}", handle);
        }
        removed
    }

    /// Check whether a handle is live
    pub fn contains(&self, handle: CallbackHandle) -> bool {
        self.callbacks.contains_key(&handle)
    }

    /// Number of live callbacks
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// True if no callbacks are registered
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackResolver for CallbackRegistry {
    fn resolve(&mut self, handle: CallbackHandle) -> Option<ResolvedCallback<'_>> {
        let one_shot = self.callbacks.get(&handle)?.is_one_shot();
        if one_shot {
            match self.callbacks.remove(&handle)? {
                Callback::OneShot(f) => Some(ResolvedCallback::OneShot(f)),
                // is_one_shot() was checked above
                Callback::Persistent(_) => None,
            }
        } else {
            match self.callbacks.get_mut(&handle)? {
                Callback::Persistent(f) => Some(ResolvedCallback::Persistent(f)),
                Callback::OneShot(_) => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_handles_are_unique() {
        let mut registry = CallbackRegistry::new();
        let a = registry.register(|_| Ok(()));
        let b = registry.register(|_| Ok(()));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_persistent_callback_resolves_repeatedly() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();

        let mut registry = CallbackRegistry::new();
        let handle = registry.register(move |args| {
            sink.borrow_mut().push(args);
            Ok(())
        });

        for i in 0..3 {
            let callback = registry.resolve(handle).unwrap();
            callback.invoke(vec![json!(i)]).unwrap();
        }

        assert_eq!(calls.borrow().len(), 3);
        assert!(registry.contains(handle));
    }

    #[test]
    fn test_one_shot_is_released_on_resolve() {
        let mut registry = CallbackRegistry::new();
        let handle = registry.register_once(|_| Ok(()));

        assert!(registry.resolve(handle).is_some());
        assert!(registry.resolve(handle).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_insert_advances_next_handle() {
        let mut registry = CallbackRegistry::new();
        assert!(registry.insert(CallbackHandle(7), Callback::persistent(|_| Ok(()))).is_none());

        let next = registry.register(|_| Ok(()));
        assert_eq!(next, CallbackHandle(8));
    }

    #[test]
    fn test_release() {
        let mut registry = CallbackRegistry::new();
        let handle = registry.register(|_| Ok(()));

        assert!(registry.release(handle));
        assert!(!registry.release(handle));
        assert!(registry.resolve(handle).is_none());
    }
}

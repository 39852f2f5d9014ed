//! Callback Channel Library
//!
//! A thread-safe hand-off for invoking callbacks that live in a
//! single-threaded consumer context (a script runtime, a UI loop, ...) from
//! any number of native producer threads.
//!
//! # Architecture
//!
//! - Producers hold a [`CallbackSender`] and call `enqueue(handle, args)`.
//!   Enqueueing only takes a short lock around the queue insertion.
//! - The consumer owns the [`Dispatcher`], which owns the callbacks (through a
//!   [`CallbackResolver`], usually a [`CallbackRegistry`]). Each
//!   `drain_and_dispatch` delivers the requests queued at that moment, in
//!   enqueue order.
//! - Handles are resolved only at delivery time. Unknown handles, failing
//!   callbacks and requests cancelled by teardown are reported to a
//!   [`DiagnosticSink`] and never raised on the consumer thread.
//!
//! [`Promise`] and [`EventEmitter`] are thin helpers over `enqueue` for the
//! two common bridge patterns: settling an async call and emitting named
//! events. [`StateSubscriptions`] builds change polling on top of promises.
//!
//! # Example Usage
//!
//! ```
//! use callback_channel::{CallbackRegistry, ChannelConfig, Dispatcher};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let mut registry = CallbackRegistry::new();
//! let greet = registry.register(|args| {
//!     println!("hello {}", args[0]);
//!     Ok(())
//! });
//!
//! let mut dispatcher = Dispatcher::new(ChannelConfig::new(), registry);
//!
//! let producers: Vec<_> = (0..3)
//!     .map(|i| {
//!         let sender = dispatcher.sender();
//!         std::thread::spawn(move || sender.enqueue(greet, vec![json!(i)]))
//!     })
//!     .collect();
//! for producer in producers {
//!     producer.join().unwrap().unwrap();
//! }
//!
//! dispatcher.wait_for_work(Duration::from_millis(100));
//! let report = dispatcher.drain_and_dispatch();
//! assert_eq!(report.delivered, 3);
//! ```

// Public modules
pub mod channel;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod promise;
pub mod registry;
pub mod subscriptions;
pub mod types;

// Re-export main types for convenience
pub use channel::{CallbackSender, DispatchStats, Dispatcher, DrainReport, WakeHook};
pub use config::ChannelConfig;
pub use diagnostics::{
    CollectingSink, Diagnostic, DiagnosticKind, DiagnosticSink, LogSink, NullSink,
};
pub use events::{EmitterError, EventEmitter, ForwardSummary};
pub use promise::{ErrorInterceptor, Promise, UserInfo};
pub use registry::{Callback, CallbackRegistry, CallbackResolver, ResolvedCallback};
pub use subscriptions::StateSubscriptions;
pub use types::{
    to_value, CallbackError, CallbackHandle, CallbackResult, ChannelError, InvocationRequest,
    Result, Timestamp, Value,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Callback dispatch channel
//!
//! This module provides the hand-off point between any number of producer
//! threads and the single consumer context that owns the callbacks.
//!
//! - [`CallbackSender`] is cheap to clone and can be moved to any thread.
//!   `enqueue` holds the queue lock only for the insertion step.
//! - [`Dispatcher`] lives on the consumer side. Each call to
//!   `drain_and_dispatch` swaps the pending queue out and delivers exactly the
//!   requests that were queued at that moment, so callbacks may enqueue more
//!   work without extending the current cycle.

use crate::config::ChannelConfig;
use crate::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink, LogSink, NullSink};
use crate::registry::CallbackResolver;
use crate::types::{CallbackError, CallbackHandle, ChannelError, InvocationRequest, Result, Value};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Hook invoked when an enqueue moves the queue from empty to non-empty
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

/// Queue state guarded by the channel lock
#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<InvocationRequest>,
    closed: bool,
}

/// State shared between senders and the dispatcher
struct Shared {
    state: Mutex<QueueState>,
    /// Signalled on the empty -> non-empty transition and on close
    ready: Condvar,
    config: ChannelConfig,
    wake: Option<WakeHook>,
    /// Total requests accepted (for metrics)
    enqueued_count: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The lock is never held while user code runs, so a poisoned lock
        // still guards a consistent queue.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side of the channel
///
/// Clone it freely and move the clones to whichever threads need to invoke
/// callbacks.
#[derive(Clone)]
pub struct CallbackSender {
    shared: Arc<Shared>,
}

impl CallbackSender {
    /// Enqueue an invocation of `handle` with `args`
    ///
    /// Returns as soon as the request is in the queue; never waits for the
    /// consumer. The handle is not validated here, only at delivery.
    ///
    /// # Errors
    /// * `ChannelClosed` if the dispatcher has been torn down
    /// * `QueueFull` if a capacity was configured and has been reached
    ///
    /// # Example
    /// ```
    /// use callback_channel::{CallbackRegistry, ChannelConfig, Dispatcher};
    /// use serde_json::json;
    ///
    /// let mut registry = CallbackRegistry::new();
    /// let handle = registry.register(|args| {
    ///     println!("called with {:?}", args);
    ///     Ok(())
    /// });
    ///
    /// let mut dispatcher = Dispatcher::new(ChannelConfig::new(), registry);
    /// let sender = dispatcher.sender();
    ///
    /// std::thread::spawn(move || sender.enqueue(handle, vec![json!("hello")]))
    ///     .join()
    ///     .unwrap()
    ///     .unwrap();
    ///
    /// let report = dispatcher.drain_and_dispatch();
    /// assert_eq!(report.delivered, 1);
    /// ```
    pub fn enqueue(&self, handle: CallbackHandle, args: Vec<Value>) -> Result<()> {
        let request = InvocationRequest::new(handle, args);

        let was_empty = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(ChannelError::ChannelClosed(handle));
            }
            let depth = state.pending.len();
            if !self.shared.config.admits(depth) {
                return Err(ChannelError::QueueFull {
                    depth,
                    limit: self.shared.config.limit().unwrap_or(depth),
                });
            }
            state.pending.push_back(request);
            depth == 0
        };

        self.shared.enqueued_count.fetch_add(1, Ordering::Relaxed);

        if was_empty {
            self.shared.ready.notify_all();
            if let Some(wake) = &self.shared.wake {
                wake();
            }
        }
        Ok(())
    }

    /// Number of requests waiting for the next drain cycle
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// True once the dispatcher has been torn down
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Total requests ever accepted by this channel
    pub fn enqueued_count(&self) -> u64 {
        self.shared.enqueued_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for CallbackSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSender")
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Callbacks that ran and returned Ok
    pub delivered: usize,
    /// Requests whose handle did not resolve
    pub unresolved: usize,
    /// Callbacks that returned an error or panicked
    pub failed: usize,
}

impl DrainReport {
    /// Number of requests taken out of the queue
    pub fn total(&self) -> usize {
        self.delivered + self.unresolved + self.failed
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn merge(&mut self, other: DrainReport) {
        self.delivered += other.delivered;
        self.unresolved += other.unresolved;
        self.failed += other.failed;
    }
}

/// Cumulative counters over the dispatcher's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Non-empty drain cycles run
    pub cycles: u64,
    pub delivered: u64,
    pub unresolved: u64,
    pub failed: u64,
    /// Requests discarded by teardown
    pub cancelled: u64,
}

/// Consumer side of the channel
///
/// Owns the resolver and the diagnostics sink. Only one dispatcher exists per
/// channel and `drain_and_dispatch` takes `&mut self`, so deliveries can never
/// overlap.
pub struct Dispatcher<R: CallbackResolver> {
    shared: Arc<Shared>,
    resolver: R,
    sink: Box<dyn DiagnosticSink>,
    stats: DispatchStats,
}

impl<R: CallbackResolver> Dispatcher<R> {
    /// Create a channel and its dispatcher
    pub fn new(config: ChannelConfig, resolver: R) -> Self {
        Self::build(config, resolver, None)
    }

    /// Create a channel whose senders call `wake` on the empty -> non-empty transition
    ///
    /// The hook runs on the producer thread, outside the queue lock.
    pub fn with_waker<W>(config: ChannelConfig, resolver: R, wake: W) -> Self
    where
        W: Fn() + Send + Sync + 'static,
    {
        Self::build(config, resolver, Some(Arc::new(wake)))
    }

    fn build(config: ChannelConfig, resolver: R, wake: Option<WakeHook>) -> Self {
        let sink: Box<dyn DiagnosticSink> = if config.log_diagnostics {
            Box::new(LogSink)
        } else {
            Box::new(NullSink)
        };

        log::debug!("Creating callback channel (capacity: {:?})", config.limit());

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
                config,
                wake,
                enqueued_count: AtomicU64::new(0),
            }),
            resolver,
            sink,
            stats: DispatchStats::default(),
        }
    }

    /// Builder method: replace the diagnostics sink
    pub fn with_sink<S>(mut self, sink: S) -> Self
    where
        S: DiagnosticSink + 'static,
    {
        self.sink = Box::new(sink);
        self
    }

    /// Get a new producer handle for this channel
    pub fn sender(&self) -> CallbackSender {
        CallbackSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Access the resolver, e.g. to register callbacks between drain cycles
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut R {
        &mut self.resolver
    }

    /// Deliver every request queued at the moment of the call
    ///
    /// Requests are delivered in enqueue order. Unresolved handles and failing
    /// callbacks are reported to the sink and do not affect the other
    /// requests of the cycle. Requests enqueued while this runs (including by
    /// the callbacks themselves) are left for the next cycle.
    pub fn drain_and_dispatch(&mut self) -> DrainReport {
        let batch = std::mem::take(&mut self.shared.lock().pending);
        let mut report = DrainReport::default();

        if batch.is_empty() {
            return report;
        }

        self.stats.cycles += 1;
        log::debug!(
            "Drain cycle {}: dispatching {} requests",
            self.stats.cycles,
            batch.len()
        );

        for request in batch {
            self.deliver(request, &mut report);
        }

        self.stats.delivered += report.delivered as u64;
        self.stats.unresolved += report.unresolved as u64;
        self.stats.failed += report.failed as u64;

        log::debug!(
            "Drain cycle {} done: {} delivered, {} unresolved, {} failed",
            self.stats.cycles,
            report.delivered,
            report.unresolved,
            report.failed
        );
        report
    }

    /// Run drain cycles until one finds the queue empty
    ///
    /// Stops after `max_cycles` even if callbacks keep enqueueing work.
    pub fn run_until_idle(&mut self, max_cycles: usize) -> DrainReport {
        let mut total = DrainReport::default();
        for _ in 0..max_cycles {
            let report = self.drain_and_dispatch();
            if report.is_empty() {
                break;
            }
            total.merge(report);
        }
        total
    }

    /// Block until work is pending or `timeout` elapses
    ///
    /// Returns true if the queue is non-empty.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .ready
            .wait_timeout_while(state, timeout, |s| s.pending.is_empty() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        !state.pending.is_empty()
    }

    /// Tear the channel down
    ///
    /// Every pending request is discarded and reported as cancelled; later
    /// enqueues fail with `ChannelClosed`. Returns the number of requests
    /// cancelled. Calling it again is a no-op.
    pub fn close(&mut self) -> usize {
        let cancelled = {
            let mut state = self.shared.lock();
            if state.closed {
                return 0;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        self.shared.ready.notify_all();

        let count = cancelled.len();
        for request in cancelled {
            self.sink.report(Diagnostic::new(
                request.handle,
                request.args.len(),
                DiagnosticKind::Cancelled,
            ));
        }
        self.stats.cancelled += count as u64;

        log::info!("Callback channel closed ({} pending requests cancelled)", count);
        count
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Number of requests waiting for the next drain cycle
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Cumulative counters
    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Total requests ever accepted by this channel
    pub fn enqueued_count(&self) -> u64 {
        self.shared.enqueued_count.load(Ordering::Relaxed)
    }

    fn deliver(&mut self, request: InvocationRequest, report: &mut DrainReport) {
        let InvocationRequest { handle, args, .. } = request;
        let arg_count = args.len();

        let outcome = match self.resolver.resolve(handle) {
            Some(callback) => Some(
                panic::catch_unwind(AssertUnwindSafe(move || callback.invoke(args)))
                    .unwrap_or_else(|payload| Err(CallbackError::from_panic(payload))),
            ),
            None => None,
        };

        match outcome {
            Some(Ok(())) => {
                log::trace!("Delivered callback {} ({} args)", handle, arg_count);
                report.delivered += 1;
            }
            Some(Err(error)) => {
                report.failed += 1;
                self.sink.report(Diagnostic::new(
                    handle,
                    arg_count,
                    DiagnosticKind::CallbackFailed(error),
                ));
            }
            None => {
                report.unresolved += 1;
                self.sink.report(Diagnostic::new(
                    handle,
                    arg_count,
                    DiagnosticKind::UnresolvedHandle,
                ));
            }
        }
    }
}

impl<R: CallbackResolver> Drop for Dispatcher<R> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<R: CallbackResolver> fmt::Debug for Dispatcher<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::registry::{Callback, CallbackRegistry};
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> ChannelConfig {
        ChannelConfig::new().with_log_diagnostics(false)
    }

    fn recording_registry() -> (CallbackRegistry, CallbackHandle, Rc<RefCell<Vec<Vec<Value>>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        let mut registry = CallbackRegistry::new();
        let handle = registry.register(move |args| {
            sink.borrow_mut().push(args);
            Ok(())
        });
        (registry, handle, calls)
    }

    #[test]
    fn test_enqueue_increments_pending() {
        let (registry, handle, _) = recording_registry();
        let dispatcher = Dispatcher::new(quiet_config(), registry);
        let sender = dispatcher.sender();

        sender.enqueue(handle, vec![]).unwrap();
        sender.enqueue(handle, vec![json!(1)]).unwrap();

        assert_eq!(sender.pending(), 2);
        assert_eq!(dispatcher.pending(), 2);
        assert_eq!(dispatcher.enqueued_count(), 2);
    }

    #[test]
    fn test_drain_preserves_enqueue_order() {
        let (registry, handle, calls) = recording_registry();
        let mut dispatcher = Dispatcher::new(quiet_config(), registry);
        let sender = dispatcher.sender();

        for i in 0..10 {
            sender.enqueue(handle, vec![json!(i)]).unwrap();
        }

        let report = dispatcher.drain_and_dispatch();
        assert_eq!(report.delivered, 10);

        let seen: Vec<i64> = calls
            .borrow()
            .iter()
            .map(|args| args[0].as_i64().unwrap())
            .collect();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(dispatcher.pending(), 0);
    }

    #[test]
    fn test_unresolved_handle_is_reported() {
        let sink = CollectingSink::new();
        let mut dispatcher =
            Dispatcher::new(quiet_config(), CallbackRegistry::new()).with_sink(sink.clone());

        dispatcher.sender().enqueue(CallbackHandle(99), vec![]).unwrap();
        let report = dispatcher.drain_and_dispatch();

        assert_eq!(report.unresolved, 1);
        assert_eq!(report.delivered, 0);
        let diagnostics = sink.snapshot();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].handle, CallbackHandle(99));
        assert!(diagnostics[0].is_unresolved());
    }

    #[test]
    fn test_failing_callback_does_not_affect_siblings() {
        let (mut registry, good, calls) = recording_registry();
        let bad = registry.register(|_| Err(CallbackError::new("nope")));
        let sink = CollectingSink::new();
        let mut dispatcher = Dispatcher::new(quiet_config(), registry).with_sink(sink.clone());
        let sender = dispatcher.sender();

        sender.enqueue(good, vec![json!("a")]).unwrap();
        sender.enqueue(bad, vec![]).unwrap();
        sender.enqueue(good, vec![json!("b")]).unwrap();

        let report = dispatcher.drain_and_dispatch();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(calls.borrow().len(), 2);
        assert!(sink.snapshot()[0].is_callback_failure());
    }

    #[test]
    fn test_panicking_callback_is_captured() {
        let (mut registry, good, calls) = recording_registry();
        let bad = registry.register(|_| panic!("callback exploded"));
        let sink = CollectingSink::new();
        let mut dispatcher = Dispatcher::new(quiet_config(), registry).with_sink(sink.clone());
        let sender = dispatcher.sender();

        sender.enqueue(bad, vec![]).unwrap();
        sender.enqueue(good, vec![]).unwrap();

        let report = dispatcher.drain_and_dispatch();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(calls.borrow().len(), 1);

        match &sink.snapshot()[0].kind {
            DiagnosticKind::CallbackFailed(error) => {
                assert_eq!(error.kind, "Panic");
                assert_eq!(error.message, "callback exploded");
            }
            other => panic!("unexpected diagnostic: {:?}", other),
        }
    }

    #[test]
    fn test_reentrant_enqueue_goes_to_next_cycle() {
        let mut dispatcher = Dispatcher::new(quiet_config(), CallbackRegistry::new());
        let sender = dispatcher.sender();
        let runs = Rc::new(RefCell::new(0usize));
        let counter = runs.clone();

        let handle = CallbackHandle(1);
        dispatcher.resolver_mut().insert(
            handle,
            Callback::persistent(move |_| {
                *counter.borrow_mut() += 1;
                sender.enqueue(handle, vec![]).map_err(|e| CallbackError::new(e.to_string()))
            }),
        );

        dispatcher.sender().enqueue(handle, vec![]).unwrap();

        assert_eq!(dispatcher.drain_and_dispatch().delivered, 1);
        assert_eq!(*runs.borrow(), 1);
        assert_eq!(dispatcher.pending(), 1);

        assert_eq!(dispatcher.drain_and_dispatch().delivered, 1);
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    fn test_run_until_idle_is_bounded() {
        let mut dispatcher = Dispatcher::new(quiet_config(), CallbackRegistry::new());
        let sender = dispatcher.sender();
        let handle = CallbackHandle(1);
        dispatcher.resolver_mut().insert(
            handle,
            Callback::persistent(move |_| {
                sender.enqueue(handle, vec![]).map_err(|e| CallbackError::new(e.to_string()))
            }),
        );
        dispatcher.sender().enqueue(handle, vec![]).unwrap();

        let report = dispatcher.run_until_idle(5);
        assert_eq!(report.delivered, 5);
        assert_eq!(dispatcher.stats().cycles, 5);
    }

    #[test]
    fn test_one_shot_delivered_once() {
        let mut registry = CallbackRegistry::new();
        let handle = registry.register_once(|_| Ok(()));
        let sink = CollectingSink::new();
        let mut dispatcher = Dispatcher::new(quiet_config(), registry).with_sink(sink.clone());
        let sender = dispatcher.sender();

        sender.enqueue(handle, vec![]).unwrap();
        sender.enqueue(handle, vec![]).unwrap();

        let report = dispatcher.drain_and_dispatch();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.unresolved, 1);
    }

    #[test]
    fn test_close_cancels_pending_and_rejects_enqueue() {
        let (registry, handle, calls) = recording_registry();
        let sink = CollectingSink::new();
        let mut dispatcher = Dispatcher::new(quiet_config(), registry).with_sink(sink.clone());
        let sender = dispatcher.sender();

        sender.enqueue(handle, vec![]).unwrap();
        sender.enqueue(handle, vec![]).unwrap();

        assert_eq!(dispatcher.close(), 2);
        assert_eq!(dispatcher.close(), 0);
        assert!(sender.is_closed());
        assert_eq!(
            sender.enqueue(handle, vec![]),
            Err(ChannelError::ChannelClosed(handle))
        );

        assert!(dispatcher.drain_and_dispatch().is_empty());
        assert!(calls.borrow().is_empty());
        assert_eq!(sink.len(), 2);
        assert!(sink.snapshot().iter().all(|d| d.is_cancelled()));
        assert_eq!(dispatcher.stats().cancelled, 2);
    }

    #[test]
    fn test_drop_closes_channel() {
        let sink = CollectingSink::new();
        let dispatcher =
            Dispatcher::new(quiet_config(), CallbackRegistry::new()).with_sink(sink.clone());
        let sender = dispatcher.sender();
        sender.enqueue(CallbackHandle(1), vec![]).unwrap();

        drop(dispatcher);

        assert!(sender.is_closed());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let dispatcher =
            Dispatcher::new(quiet_config().with_capacity(2), CallbackRegistry::new());
        let sender = dispatcher.sender();

        sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        assert_eq!(
            sender.enqueue(CallbackHandle(1), vec![]),
            Err(ChannelError::QueueFull { depth: 2, limit: 2 })
        );
        assert_eq!(sender.pending(), 2);
    }

    #[test]
    fn test_zero_capacity_never_refuses_enqueue() {
        assert!(serde_json::from_str::<ChannelConfig>(r#"{"capacity":0}"#).is_err());

        let dispatcher =
            Dispatcher::new(quiet_config().with_capacity(0), CallbackRegistry::new());
        let sender = dispatcher.sender();
        sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        assert_eq!(sender.pending(), 1);
    }

    #[test]
    fn test_waker_fires_on_empty_to_non_empty() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = wakes.clone();
        let mut dispatcher = Dispatcher::with_waker(quiet_config(), CallbackRegistry::new(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let sender = dispatcher.sender();

        sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 1);

        dispatcher.drain_and_dispatch();
        sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        assert_eq!(wakes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_wait_for_work() {
        let dispatcher = Dispatcher::new(quiet_config(), CallbackRegistry::new());
        assert!(!dispatcher.wait_for_work(Duration::from_millis(10)));

        let sender = dispatcher.sender();
        let producer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            sender.enqueue(CallbackHandle(1), vec![]).unwrap();
        });

        assert!(dispatcher.wait_for_work(Duration::from_secs(5)));
        producer.join().unwrap();
    }
}

//! Load scenario
//!
//! Spawns producer threads on a rayon pool, drains on the calling thread, and
//! checks that every request arrived exactly once and in per-producer order.

use crate::config::ScenarioConfig;
use anyhow::{Context, Result};
use callback_channel::{
    CallbackError, CallbackHandle, CallbackRegistry, CallbackResolver, ChannelError,
    CollectingSink, Dispatcher, DispatchStats,
};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Which callback a generated request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Deliver,
    Fail,
    Released,
}

fn target_for(seq: usize, config: &ScenarioConfig) -> Target {
    let n = seq + 1;
    let load = &config.scenario;
    if load.unregistered_every > 0 && n % load.unregistered_every == 0 {
        Target::Released
    } else if load.failing_every > 0 && n % load.failing_every == 0 {
        Target::Fail
    } else {
        Target::Deliver
    }
}

/// Per-producer delivery bookkeeping
#[derive(Debug, Default)]
struct OrderTracker {
    next_seq: HashMap<u64, u64>,
    delivered: u64,
    out_of_order: u64,
}

impl OrderTracker {
    fn record(&mut self, producer: u64, seq: u64) {
        let expected = self.next_seq.entry(producer).or_insert(0);
        if seq < *expected {
            self.out_of_order += 1;
        }
        *expected = seq + 1;
        self.delivered += 1;
    }
}

/// Everything the report needs about a finished run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub producers: usize,
    pub requests_per_producer: usize,
    pub capacity: Option<usize>,
    /// Requests accepted by the channel
    pub enqueued: u64,
    /// Enqueue attempts refused because the queue was full
    pub rejected_full: u64,
    pub cycles: u64,
    pub delivered: u64,
    pub unresolved: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Deliveries whose sequence number went backwards for their producer
    pub out_of_order: u64,
    pub diagnostics: Vec<String>,
    pub elapsed_ms: u64,
    pub started_at: String,
}

impl ScenarioOutcome {
    /// True if every accepted request was accounted for in order
    pub fn is_consistent(&self) -> bool {
        self.out_of_order == 0
            && self.delivered + self.unresolved + self.failed + self.cancelled == self.enqueued
    }
}

/// Drain until `worker` has exited, whether it returned or panicked
fn drain_while_running<R: CallbackResolver, T>(
    dispatcher: &mut Dispatcher<R>,
    worker: &thread::JoinHandle<T>,
    interval: Duration,
) {
    while !worker.is_finished() {
        dispatcher.wait_for_work(interval);
        dispatcher.drain_and_dispatch();
    }
}

/// Run the configured scenario to completion
pub fn run(config: &ScenarioConfig) -> Result<ScenarioOutcome> {
    let started_at = chrono::Utc::now();
    let start = Instant::now();
    let load = config.scenario.clone();

    log::info!(
        "Starting scenario: {} producers x {} requests (capacity: {:?})",
        load.producers,
        load.requests_per_producer,
        config.channel.limit()
    );

    let tracker = Rc::new(RefCell::new(OrderTracker::default()));
    let mut registry = CallbackRegistry::new();

    let recorder = tracker.clone();
    let deliver = registry.register(move |args| {
        let producer = args.first().and_then(|v| v.as_u64());
        let seq = args.get(1).and_then(|v| v.as_u64());
        match (producer, seq) {
            (Some(producer), Some(seq)) => {
                recorder.borrow_mut().record(producer, seq);
                Ok(())
            }
            _ => Err(CallbackError::with_kind("BadArguments", format!("{:?}", args))),
        }
    });
    let fail = registry.register(|args| {
        Err(CallbackError::with_kind("Simulated", "scenario failure")
            .caused_by(CallbackError::new(format!("args: {:?}", args))))
    });
    let released = registry.register(|_| Ok(()));
    registry.release(released);

    let sink = CollectingSink::new();
    let mut dispatcher = Dispatcher::new(config.channel.clone(), registry).with_sink(sink.clone());

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(load.producers)
        .thread_name(|i| format!("producer-{}", i))
        .build()
        .context("Failed to build producer thread pool")?;

    let rejected_full = Arc::new(AtomicU64::new(0));

    let producer_thread = {
        let sender = dispatcher.sender();
        let rejected_full = rejected_full.clone();
        let config = config.clone();
        thread::spawn(move || {
            pool.install(|| {
                (0..config.scenario.producers).into_par_iter().for_each(|p| {
                    for seq in 0..config.scenario.requests_per_producer {
                        let handle: CallbackHandle = match target_for(seq, &config) {
                            Target::Deliver => deliver,
                            Target::Fail => fail,
                            Target::Released => released,
                        };
                        loop {
                            match sender.enqueue(handle, vec![json!(p), json!(seq)]) {
                                Ok(()) => break,
                                Err(ChannelError::QueueFull { .. }) => {
                                    rejected_full.fetch_add(1, Ordering::Relaxed);
                                    thread::yield_now();
                                }
                                Err(e) => {
                                    log::error!("Producer {} stopped: {}", p, e);
                                    return;
                                }
                            }
                        }
                    }
                    log::debug!("Producer {} finished", p);
                });
            });
        })
    };

    let interval = Duration::from_millis(load.drain_interval_ms.max(1));
    drain_while_running(&mut dispatcher, &producer_thread, interval);
    producer_thread
        .join()
        .map_err(|_| anyhow::anyhow!("producer thread panicked"))?;

    // Everything is enqueued now; one more cycle picks up the tail
    dispatcher.drain_and_dispatch();
    dispatcher.close();

    let stats: DispatchStats = dispatcher.stats();
    let enqueued = dispatcher.enqueued_count();
    let tracker = tracker.borrow();
    if tracker.delivered != stats.delivered {
        log::warn!(
            "Tracker saw {} deliveries, dispatcher counted {}",
            tracker.delivered,
            stats.delivered
        );
    }

    let outcome = ScenarioOutcome {
        producers: load.producers,
        requests_per_producer: load.requests_per_producer,
        capacity: config.channel.limit(),
        enqueued,
        rejected_full: rejected_full.load(Ordering::Relaxed),
        cycles: stats.cycles,
        delivered: stats.delivered,
        unresolved: stats.unresolved,
        failed: stats.failed,
        cancelled: stats.cancelled,
        out_of_order: tracker.out_of_order,
        diagnostics: sink.take().iter().map(|d| d.to_string()).collect(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        started_at: started_at.to_rfc3339(),
    };

    log::info!(
        "Scenario finished in {} ms over {} drain cycles",
        outcome.elapsed_ms,
        outcome.cycles
    );
    Ok(outcome)
}

// Multi-threaded delivery properties of the callback channel

use callback_channel::{
    Callback, CallbackHandle, CallbackRegistry, ChannelConfig, CollectingSink, Dispatcher, Value,
};
use serde_json::json;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

fn quiet() -> ChannelConfig {
    let _ = env_logger::builder().is_test(true).try_init();
    ChannelConfig::new().with_log_diagnostics(false)
}

/// Registry with handle 7 appending its first string argument to a log
fn log_registry() -> (CallbackRegistry, Rc<RefCell<Vec<String>>>) {
    let output = Rc::new(RefCell::new(Vec::new()));
    let sink = output.clone();
    let mut registry = CallbackRegistry::new();
    registry.insert(
        CallbackHandle(7),
        Callback::persistent(move |args: Vec<Value>| {
            let text = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            sink.borrow_mut().push(text);
            Ok(())
        }),
    );
    (registry, output)
}

#[test]
fn three_producers_each_delivered_once() {
    let (registry, output) = log_registry();
    let mut dispatcher = Dispatcher::new(quiet(), registry);

    let producers: Vec<_> = ["a", "b", "c"]
        .into_iter()
        .map(|s| {
            let sender = dispatcher.sender();
            thread::spawn(move || sender.enqueue(CallbackHandle(7), vec![json!(s)]))
        })
        .collect();
    for producer in producers {
        producer.join().unwrap().unwrap();
    }

    let report = dispatcher.drain_and_dispatch();
    assert_eq!(report.delivered, 3);

    let mut seen = output.borrow().clone();
    seen.sort();
    assert_eq!(seen, vec!["a", "b", "c"]);
}

#[test]
fn concurrent_producers_exactly_once_in_per_thread_order() {
    const PRODUCERS: usize = 8;
    const PER_PRODUCER: usize = 500;

    let received: Rc<RefCell<Vec<(u64, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = received.clone();
    let mut registry = CallbackRegistry::new();
    let handle = registry.register(move |args| {
        let producer = args[0].as_u64().unwrap_or(u64::MAX);
        let seq = args[1].as_u64().unwrap_or(u64::MAX);
        sink.borrow_mut().push((producer, seq));
        Ok(())
    });

    let mut dispatcher = Dispatcher::new(quiet(), registry);

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let sender = dispatcher.sender();
            thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    sender.enqueue(handle, vec![json!(p), json!(i)]).unwrap();
                }
            })
        })
        .collect();

    // Drain concurrently with the producers
    let mut finished = false;
    while !finished {
        dispatcher.wait_for_work(Duration::from_millis(5));
        dispatcher.drain_and_dispatch();
        finished = producers.iter().all(|p| p.is_finished());
    }
    for producer in producers {
        producer.join().unwrap();
    }
    dispatcher.drain_and_dispatch();

    let received = received.borrow();
    assert_eq!(received.len(), PRODUCERS * PER_PRODUCER);

    let mut next_expected: HashMap<u64, u64> = HashMap::new();
    for (producer, seq) in received.iter() {
        let expected = next_expected.entry(*producer).or_insert(0);
        assert_eq!(*seq, *expected, "producer {} delivered out of order", producer);
        *expected += 1;
    }
    assert!(next_expected.values().all(|&n| n == PER_PRODUCER as u64));
    assert_eq!(dispatcher.stats().delivered, (PRODUCERS * PER_PRODUCER) as u64);
}

#[test]
fn unregistered_handle_reported_without_crash() {
    let sink = CollectingSink::new();
    let (registry, output) = log_registry();
    let mut dispatcher = Dispatcher::new(quiet(), registry).with_sink(sink.clone());
    let sender = dispatcher.sender();

    sender.enqueue(CallbackHandle(99), vec![]).unwrap();
    sender.enqueue(CallbackHandle(7), vec![json!("after")]).unwrap();

    let report = dispatcher.drain_and_dispatch();
    assert_eq!(report.unresolved, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(*output.borrow(), vec!["after"]);

    let diagnostics = sink.snapshot();
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0].is_unresolved());
    assert_eq!(diagnostics[0].handle, CallbackHandle(99));
}

#[test]
fn released_handle_is_unresolved() {
    let sink = CollectingSink::new();
    let (registry, output) = log_registry();
    let mut dispatcher = Dispatcher::new(quiet(), registry).with_sink(sink.clone());
    let sender = dispatcher.sender();

    sender.enqueue(CallbackHandle(7), vec![json!("x")]).unwrap();
    assert!(dispatcher.resolver_mut().release(CallbackHandle(7)));

    let report = dispatcher.drain_and_dispatch();
    assert_eq!(report.unresolved, 1);
    assert!(output.borrow().is_empty());
    assert_eq!(sink.len(), 1);
}

#[test]
fn enqueue_during_drain_waits_for_next_cycle() {
    let (registry, output) = log_registry();
    let mut dispatcher = Dispatcher::new(quiet(), registry);
    let sender = dispatcher.sender();

    let echo = sender.clone();
    let forward = dispatcher.resolver_mut().register(move |args| {
        echo.enqueue(CallbackHandle(7), args)
            .map_err(|e| callback_channel::CallbackError::new(e.to_string()))
    });

    sender.enqueue(forward, vec![json!("later")]).unwrap();
    sender.enqueue(CallbackHandle(7), vec![json!("now")]).unwrap();

    let first = dispatcher.drain_and_dispatch();
    assert_eq!(first.delivered, 2);
    assert_eq!(*output.borrow(), vec!["now"]);

    let second = dispatcher.drain_and_dispatch();
    assert_eq!(second.delivered, 1);
    assert_eq!(*output.borrow(), vec!["now", "later"]);
}

#[test]
fn producers_racing_teardown_never_block() {
    let sink = CollectingSink::new();
    let (registry, _output) = log_registry();
    let mut dispatcher = Dispatcher::new(quiet(), registry).with_sink(sink.clone());

    let producers: Vec<_> = (0..4)
        .map(|_| {
            let sender = dispatcher.sender();
            thread::spawn(move || {
                let mut accepted = 0usize;
                for _ in 0..1000 {
                    if sender.enqueue(CallbackHandle(7), vec![json!("x")]).is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            })
        })
        .collect();

    let delivered = dispatcher.drain_and_dispatch().delivered;
    let cancelled = dispatcher.close();
    let accepted: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();

    // Every accepted request is either delivered or reported as cancelled
    assert_eq!(delivered + cancelled, accepted);
    assert_eq!(sink.len(), cancelled);
}

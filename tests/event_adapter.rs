//! External events driven by a runtime's idle workers.

#[macro_use]
mod common;

use common::*;
use parcelrt::error::ErrorKind;
use parcelrt::event::{EventStatus, EventToken};
use parcelrt::runtime::{Runtime, RuntimeBuilder};
use parcelrt::types::LocalityId;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn runtime(sink: &SinkRecorder) -> Runtime {
    init_test_logging();
    RuntimeBuilder::new(LocalityId::new(5))
        .worker_threads(2)
        .poll_interval(Duration::from_micros(500))
        .error_handler(sink.handler())
        .build()
        .expect("build")
}

#[test]
fn external_completion_resolves_the_future() {
    let sink = SinkRecorder::new();
    let rt = runtime(&sink);
    test_phase!("external_completion_resolves_the_future");

    let device_done = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&device_done);
    let future = rt.events().bind(EventToken::new("dma transfer", move || {
        if flag.load(Ordering::Acquire) {
            EventStatus::Success
        } else {
            EventStatus::Pending
        }
    }));

    let completed = future.then(|result| result.map(|()| "copied"));
    thread::sleep(Duration::from_millis(20));
    assert!(!future.is_ready());

    let device = Arc::clone(&device_done);
    let signaller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(10));
        device.store(true, Ordering::Release);
    });
    assert_eq!(
        completed.get_timeout(TEST_WAIT).expect("done").expect("value"),
        "copied"
    );
    signaller.join().expect("signaller");
    assert_eq!(rt.events().pending_count(), 0);
    assert!(sink.records().is_empty());

    rt.shutdown();
    test_complete!("external_completion_resolves_the_future");
}

#[test]
fn error_code_and_panic_fail_only_their_futures() {
    let sink = SinkRecorder::new();
    let rt = runtime(&sink);

    let failed = rt.events().bind_fn("disk", || EventStatus::Error(28));
    let panicked = rt.events().bind_fn("sensor", || panic!("sensor detached"));
    let checks = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&checks);
    let slow = rt.events().bind_fn("slow", move || {
        if c.fetch_add(1, Ordering::SeqCst) < 5 {
            EventStatus::Pending
        } else {
            EventStatus::Success
        }
    });

    let err = failed.get_timeout(TEST_WAIT).expect("done").expect_err("code");
    assert_eq!(err.kind(), ErrorKind::ExternalEvent);
    assert!(err.to_string().contains("28"), "{err}");

    let err = panicked.get_timeout(TEST_WAIT).expect("done").expect_err("panic");
    assert_eq!(err.kind(), ErrorKind::Panicked);
    assert!(err.to_string().contains("sensor detached"), "{err}");

    assert!(slow.get_timeout(TEST_WAIT).expect("done").is_ok());
    assert!(checks.load(Ordering::SeqCst) >= 6);

    // Only the panic reaches the sink; the error code belongs to its future.
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ErrorKind::Panicked);
    rt.shutdown();
}

#[test]
fn dropped_event_future_still_reports_its_failure() {
    let sink = SinkRecorder::new();
    let rt = runtime(&sink);

    // Stays pending until the future is gone.
    let armed = Arc::new(AtomicBool::new(false));
    let a = Arc::clone(&armed);
    drop(rt.events().bind_fn("fan", move || {
        if a.load(Ordering::Acquire) {
            EventStatus::Error(-7)
        } else {
            EventStatus::Pending
        }
    }));
    armed.store(true, Ordering::Release);
    assert!(wait_until(|| sink.len() == 1));
    thread::sleep(Duration::from_millis(20));

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ErrorKind::ExternalEvent);
    assert!(records[0].message.contains("-7"), "{}", records[0].message);
    rt.shutdown();
}

#[test]
fn events_resolve_while_every_worker_is_busy() {
    let sink = SinkRecorder::new();
    let rt = runtime(&sink);
    test_phase!("events_resolve_while_every_worker_is_busy");

    let stop = Arc::new(AtomicBool::new(false));
    for _ in 0..rt.config().worker_threads {
        keep_busy(rt.pool(), Arc::clone(&stop));
    }
    let ready = rt.events().bind_fn("ready now", || EventStatus::Success);
    let outcome = ready.get_timeout(TEST_WAIT);
    stop.store(true, Ordering::Release);

    assert!(matches!(outcome, Some(Ok(()))), "{outcome:?}");
    assert!(rt.pool().completed_tasks() > 0);
    rt.shutdown();
    test_complete!("events_resolve_while_every_worker_is_busy");
}

#[test]
fn shutdown_fails_events_still_pending() {
    let sink = SinkRecorder::new();
    let rt = runtime(&sink);
    let never = rt.events().bind_fn("never", || EventStatus::Pending);
    rt.shutdown();
    let err = never.get_timeout(TEST_WAIT).expect("done").expect_err("cancelled");
    assert_eq!(err.kind(), ErrorKind::Shutdown);
    assert_eq!(rt.events().pending_count(), 0);
}

//! Resource monitor tests with injected listing commands.

use std::time::Duration;

use serial_test::serial;
use tokio_util::sync::CancellationToken;

use aria2_supervisor::dispatch::Dispatcher;
use aria2_supervisor::monitor::{scan_listing, spawn_monitor, MonitorSpec};
use aria2_supervisor::Event;

use super::test_helpers::EventTap;

fn listing(script: &str, period: Duration) -> MonitorSpec {
    MonitorSpec::new("aria2c", period).with_command("sh", vec!["-c".into(), script.into()])
}

fn updates(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, Event::MonitorUpdate(_)))
        .count()
}

#[tokio::test]
#[serial]
async fn unparsable_row_is_skipped_and_later_rows_still_sampled() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let monitor = spawn_monitor(
        listing(
            "echo 'oops aria2c'; echo '77 1.5 2048 /opt/env/aria2c'",
            Duration::from_millis(100),
        ),
        dispatcher.sink(),
        CancellationToken::new(),
    );

    let Event::MonitorUpdate(sample) = tap.next().await else {
        panic!("expected a sample");
    };
    assert_eq!(sample.pid, 77);
    assert_eq!(sample.memory_kb, 2048);

    // Still alive and polling after the bad row.
    let Event::MonitorUpdate(_) = tap.next().await else {
        panic!("expected another sample");
    };
    assert!(!monitor.is_finished());

    monitor.close().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
#[serial]
async fn failing_listing_status_keeps_polling() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let monitor = spawn_monitor(
        listing("echo '5 0.0 10 aria2c'; exit 1", Duration::from_millis(50)),
        dispatcher.sink(),
        CancellationToken::new(),
    );

    let events = tap.collect_for(Duration::from_millis(600)).await;
    assert!(updates(&events) >= 2, "got {events:?}");
    assert!(!monitor.is_finished());

    monitor.close().await;
    dispatcher.shutdown().await;
}

#[tokio::test]
#[serial]
async fn missing_listing_program_reports_failure_and_stops() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let spec = MonitorSpec::new("aria2c", Duration::from_millis(50))
        .with_command("/nonexistent/listing-program", Vec::new());
    let monitor = spawn_monitor(spec, dispatcher.sink(), CancellationToken::new());

    let Event::MonitorFailed { error } = tap.next().await else {
        panic!("expected MonitorFailed");
    };
    assert!(error.contains("/nonexistent/listing-program"));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !monitor.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor stops after launch failure");

    assert!(tap.collect_for(Duration::from_millis(200)).await.is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
#[serial]
async fn cancellation_stops_the_monitor() {
    let dispatcher = Dispatcher::spawn();
    let cancel = CancellationToken::new();

    let monitor = spawn_monitor(
        listing("true", Duration::from_millis(20)),
        dispatcher.sink(),
        cancel.clone(),
    );
    cancel.cancel();

    tokio::time::timeout(Duration::from_secs(5), monitor.close())
        .await
        .expect("monitor closes promptly");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn scan_listing_publishes_only_matching_rows() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let published = scan_listing(
        "1 0.0 10 bash\n2 1.0 20 aria2c\nbroken aria2c\n3 2.0 30 aria2c\n",
        "aria2c",
        None,
        &dispatcher.sink(),
    );
    assert_eq!(published, 2);

    dispatcher.shutdown().await;
    let events = tap.collect_for(Duration::from_millis(50)).await;
    assert_eq!(updates(&events), 2);
}

#[tokio::test]
async fn scan_listing_with_pid_samples_only_that_process() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let published = scan_listing(
        "1 0.0 10 aria2c\n2 5.0 20 aria2c\n3 1.0 30 /usr/bin/myaria2c\n",
        "aria2c",
        Some(2),
        &dispatcher.sink(),
    );
    assert_eq!(published, 1);

    dispatcher.shutdown().await;
    let events = tap.collect_for(Duration::from_millis(50)).await;
    let [Event::MonitorUpdate(sample)] = events.as_slice() else {
        panic!("expected exactly one sample, got {events:?}");
    };
    assert_eq!(sample.pid, 2);
    assert_eq!(sample.memory_kb, 20);
}

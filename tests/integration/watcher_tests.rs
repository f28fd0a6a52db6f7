//! Stream watcher tests over in-memory pipes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use aria2_supervisor::dispatch::Dispatcher;
use aria2_supervisor::stream::{spawn_watcher, Classifier, StreamKind};
use aria2_supervisor::Event;

use super::test_helpers::EventTap;

#[tokio::test]
async fn classifies_every_line_until_end_of_stream() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let input: &'static [u8] =
        b"WARNING: disk full\n\nERROR: bad token\r\n03/14 01:02:03 [NOTICE] done\nhello";
    let watcher = spawn_watcher(
        StreamKind::Stderr,
        input,
        Arc::new(Classifier::standard()),
        dispatcher.sink(),
        CancellationToken::new(),
    );
    assert_eq!(watcher.kind(), StreamKind::Stderr);

    let expected = vec![
        Event::ProcessWarn {
            text: "disk full".into(),
        },
        Event::ProcessError {
            text: "bad token".into(),
        },
        Event::ProcessInfo {
            text: "done".into(),
        },
        Event::ProcessInfo {
            text: "hello".into(),
        },
    ];
    for event in expected {
        assert_eq!(tap.next().await, event);
    }

    tokio::time::timeout(Duration::from_secs(5), watcher.close())
        .await
        .expect("watcher ends at end of stream");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn cancellation_unblocks_a_pending_read() {
    let dispatcher = Dispatcher::spawn();
    let (reader, _writer) = tokio::io::duplex(64);

    let watcher = spawn_watcher(
        StreamKind::Stdout,
        reader,
        Arc::new(Classifier::standard()),
        dispatcher.sink(),
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!watcher.is_finished());

    tokio::time::timeout(Duration::from_secs(5), watcher.close())
        .await
        .expect("close returns while the writer is still open");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn close_returns_while_the_writer_keeps_writing() {
    let dispatcher = Dispatcher::spawn();
    let (reader, mut writer) = tokio::io::duplex(256);

    let flood = tokio::spawn(async move {
        while writer.write_all(b"03/14 01:02:03 [NOTICE] tick\n").await.is_ok() {}
    });
    let watcher = spawn_watcher(
        StreamKind::Stdout,
        reader,
        Arc::new(Classifier::standard()),
        dispatcher.sink(),
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(5), watcher.close())
        .await
        .expect("close returns while lines keep arriving");
    flood.await.unwrap();
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn drain_reads_buffered_output_before_returning() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);
    let (reader, mut writer) = tokio::io::duplex(256);

    let watcher = spawn_watcher(
        StreamKind::Stdout,
        reader,
        Arc::new(Classifier::standard()),
        dispatcher.sink(),
        CancellationToken::new(),
    );
    writer.write_all(b"last line\n").await.unwrap();
    drop(writer);

    watcher.drain(Duration::from_secs(5)).await;
    assert_eq!(
        tap.next().await,
        Event::ProcessInfo {
            text: "last line".into()
        }
    );
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn drain_gives_up_on_a_stream_that_stays_open() {
    let dispatcher = Dispatcher::spawn();
    let (reader, _writer) = tokio::io::duplex(64);

    let watcher = spawn_watcher(
        StreamKind::Stdout,
        reader,
        Arc::new(Classifier::standard()),
        dispatcher.sink(),
        CancellationToken::new(),
    );

    tokio::time::timeout(
        Duration::from_secs(5),
        watcher.drain(Duration::from_millis(50)),
    )
    .await
    .expect("drain cancels after its grace period");
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn overlong_line_is_dropped_and_stream_continues() {
    let dispatcher = Dispatcher::spawn();
    let mut tap = EventTap::attach_dispatcher(&dispatcher);

    let mut input = vec![b'x'; 70 * 1024];
    input.extend_from_slice(b"\nafter\n");
    let watcher = spawn_watcher(
        StreamKind::Stdout,
        std::io::Cursor::new(input),
        Arc::new(Classifier::standard()),
        dispatcher.sink(),
        CancellationToken::new(),
    );

    assert_eq!(
        tap.next().await,
        Event::ProcessInfo {
            text: "after".into()
        }
    );
    watcher.close().await;
    dispatcher.shutdown().await;
}

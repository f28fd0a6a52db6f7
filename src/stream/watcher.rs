//! Stream watcher task: one per engine output pipe.
//!
//! Reads lines with [`LogLineCodec`], classifies them, and publishes the
//! resulting events. The loop ends on end-of-stream, on a read error, or when
//! its cancellation token fires. Cancellation is checked before every read, so
//! a stream that never goes quiet cannot keep the watcher alive.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::dispatch::EventSink;

use super::classifier::Classifier;
use super::codec::LogLineCodec;

/// Which engine pipe a watcher reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Engine stdout (or the merged stream).
    Stdout,
    /// Engine stderr.
    Stderr,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// Handle to a running watcher.
#[derive(Debug)]
pub struct WatcherHandle {
    kind: StreamKind,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Pipe this watcher reads.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// True once the read loop has returned.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait up to `grace` for the stream to end on its own, then cancel.
    ///
    /// Used after the engine exited: its pipes are at end-of-stream, so the
    /// watcher normally finishes after classifying whatever was still
    /// buffered. A descendant holding the pipe open is cut off at `grace`.
    pub async fn drain(mut self, grace: Duration) {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(stream = %self.kind, %err, "stream watcher task failed"),
            Err(_) => {
                debug!(stream = %self.kind, "stream still open after exit, cancelling");
                self.close().await;
            }
        }
    }

    /// Cancel the watcher and wait for its loop to return.
    pub async fn close(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(stream = %self.kind, %err, "stream watcher task failed");
        }
    }
}

/// Spawn a watcher over `reader`.
#[must_use]
pub fn spawn_watcher<R>(
    kind: StreamKind,
    reader: R,
    classifier: Arc<Classifier>,
    sink: EventSink,
    cancel: CancellationToken,
) -> WatcherHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let task = tokio::spawn(
        watch(kind, reader, classifier, sink, cancel.clone())
            .instrument(info_span!("stream_watcher", stream = %kind)),
    );

    WatcherHandle { kind, cancel, task }
}

/// Read loop.
pub async fn watch<R>(
    kind: StreamKind,
    reader: R,
    classifier: Arc<Classifier>,
    sink: EventSink,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, LogLineCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(stream = %kind, "watcher cancelled");
                break;
            }

            item = framed.next() => match item {
                None => {
                    debug!(stream = %kind, "end of stream");
                    break;
                }
                Some(Err(err)) => {
                    warn!(stream = %kind, %err, "read failed, stopping watcher");
                    break;
                }
                Some(Ok(line)) => {
                    if let Some(event) = classifier.classify(&line) {
                        sink.publish(event);
                    }
                }
            },
        }
    }
}

//! Per-session stream registry
//!
//! At most one live push stream per session id. `create` is atomic
//! create-or-fail under one lock, `remove` cancels the in-flight pipeline
//! and is idempotent. Dropping the consumer half removes the entry too,
//! so an abandoned connection tears down its pipeline instead of leaking
//! a generation task.

use crate::stream::event::{StreamFrame, CONNECT_EVENT};
use futures::Stream;
use ragline_common::errors::{AppError, Result};
use ragline_common::metrics;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Producer half of one session's stream. Cheap to clone; all clones
/// share the frame queue and cancellation token.
#[derive(Clone, Debug)]
pub struct StreamHandle {
    session: Arc<str>,
    tx: mpsc::Sender<StreamFrame>,
    cancel: CancellationToken,
}

impl StreamHandle {
    pub fn session(&self) -> &str {
        &self.session
    }

    /// Tell the in-flight pipeline to stop producing
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token to select against while streaming
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Push one frame in order. Returns false when the consumer is gone,
    /// in which case the handle cancels itself so producers stop early.
    pub async fn send(&self, frame: StreamFrame) -> bool {
        let event = frame.event.clone();
        match self.tx.send(frame).await {
            Ok(()) => {
                metrics::record_frame(&event);
                true
            }
            Err(_) => {
                tracing::debug!(
                    session = %self.session,
                    event = %event,
                    "Consumer gone, dropping frame and cancelling"
                );
                self.cancel.cancel();
                false
            }
        }
    }
}

/// Registry of open streams, shared across handlers and pipeline tasks
#[derive(Clone, Debug)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    streams: Mutex<HashMap<String, StreamHandle>>,
    buffer: usize,
}

impl StreamRegistry {
    /// `buffer` is the per-session frame queue depth; producers block
    /// when a slow consumer falls that far behind
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                streams: Mutex::new(HashMap::new()),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Open a stream for the session, failing with `StreamAlreadyOpen`
    /// when one exists. The returned consumer has the `connect` sentinel
    /// already queued as its first frame.
    pub fn create(&self, session: &str) -> Result<EventStream> {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let handle = StreamHandle {
            session: Arc::from(session),
            tx,
            cancel: CancellationToken::new(),
        };

        let active = {
            let mut streams = self.lock();
            if streams.contains_key(session) {
                return Err(AppError::StreamAlreadyOpen {
                    session: session.to_string(),
                });
            }
            streams.insert(session.to_string(), handle.clone());
            streams.len()
        };

        // Freshly created queue, capacity is at least 1
        let _ = handle.tx.try_send(StreamFrame::connect());
        metrics::record_frame(CONNECT_EVENT);
        metrics::record_stream_opened(active);
        tracing::debug!(session, active, "Stream opened");

        Ok(EventStream {
            rx,
            _guard: StreamGuard {
                registry: self.clone(),
                session: session.to_string(),
            },
        })
    }

    /// Producer handle for the session's open stream
    pub fn get(&self, session: &str) -> Result<StreamHandle> {
        self.lock()
            .get(session)
            .cloned()
            .ok_or_else(|| AppError::StreamNotFound {
                session: session.to_string(),
            })
    }

    /// Drop the session's entry and cancel its pipeline. Idempotent;
    /// returns whether an entry was actually removed.
    pub fn remove(&self, session: &str, reason: &'static str) -> bool {
        let (removed, active) = {
            let mut streams = self.lock();
            let removed = streams.remove(session);
            (removed, streams.len())
        };

        match removed {
            Some(handle) => {
                handle.cancel();
                metrics::record_stream_closed(reason, active);
                tracing::debug!(session, reason, active, "Stream closed");
                true
            }
            None => false,
        }
    }

    /// Number of open streams
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StreamHandle>> {
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Consumer half of one session's stream. Dropping it removes the
/// session from the registry, cancelling any in-flight pipeline.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<StreamFrame>,
    _guard: StreamGuard,
}

impl EventStream {
    /// Next frame, or `None` once every producer handle is gone
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug)]
struct StreamGuard {
    registry: StreamRegistry,
    session: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.session, "consumer_dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::event::EventKind;

    #[tokio::test]
    async fn test_create_is_exclusive_per_session() {
        let registry = StreamRegistry::new(8);
        let _stream = registry.create("s1").unwrap();

        let err = registry.create("s1").unwrap_err();
        assert!(matches!(err, AppError::StreamAlreadyOpen { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_is_first_frame() {
        let registry = StreamRegistry::new(8);
        let mut stream = registry.create("s1").unwrap();

        let frame = stream.recv().await.unwrap();
        assert_eq!(frame.event, CONNECT_EVENT);
        assert_eq!(frame.data, "");
    }

    #[tokio::test]
    async fn test_remove_cancels_and_is_idempotent() {
        let registry = StreamRegistry::new(8);
        let _stream = registry.create("s1").unwrap();
        let handle = registry.get("s1").unwrap();
        assert!(!handle.is_cancelled());

        assert!(registry.remove("s1", "test"));
        assert!(handle.is_cancelled());
        assert!(!registry.remove("s1", "test"));
        assert!(registry.get("s1").is_err());
    }

    #[tokio::test]
    async fn test_dropping_consumer_removes_session() {
        let registry = StreamRegistry::new(8);
        let handle = {
            let _stream = registry.create("s1").unwrap();
            registry.get("s1").unwrap()
        };

        assert!(registry.is_empty());
        assert!(handle.is_cancelled());
        // The id is free again
        assert!(registry.create("s1").is_ok());
    }

    #[tokio::test]
    async fn test_send_after_consumer_gone_reports_false() {
        let registry = StreamRegistry::new(1);
        let stream = registry.create("s1").unwrap();
        let handle = registry.get("s1").unwrap();
        drop(stream);

        let delivered = handle.send(StreamFrame::process(EventKind::Answer, "x")).await;
        assert!(!delivered);
        assert!(handle.is_cancelled());
    }
}

//! Subscriber side of the per-connection event feed.

use futures::{Stream, StreamExt, ready};
use pin_project_lite::pin_project;
use std::future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::types::{ConnectionEvent, Frame, MatchEvent};

pin_project! {
    /// Ordered stream of one connection's events.
    ///
    /// A subscriber that falls behind the feed capacity receives a single
    /// [`ConnectionEvent::Lagged`] in place of the dropped events and then
    /// continues with the oldest retained one. The stream ends after the
    /// terminal `StateChanged` (closed or error).
    pub struct EventStream {
        #[pin]
        inner: BroadcastStream<ConnectionEvent>,
        finished: bool,
    }
}

impl EventStream {
    pub(crate) fn new(receiver: broadcast::Receiver<ConnectionEvent>) -> Self {
        Self { inner: BroadcastStream::new(receiver), finished: false }
    }
}

impl Stream for EventStream {
    type Item = ConnectionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        match ready!(this.inner.poll_next(cx)) {
            Some(Ok(event)) => {
                if let ConnectionEvent::StateChanged(state) = &event
                    && state.is_terminal()
                {
                    *this.finished = true;
                }
                Poll::Ready(Some(event))
            }
            Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                warn!("Event subscriber lagged, {} events dropped", missed);
                Poll::Ready(Some(ConnectionEvent::Lagged { missed }))
            }
            None => {
                *this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

/// Narrowing adapters for event streams.
pub trait EventStreamExt: Stream<Item = ConnectionEvent> {
    /// Only detected frames.
    fn frames(self) -> impl Stream<Item = Frame>
    where
        Self: Sized,
    {
        self.filter_map(|event| {
            future::ready(match event {
                ConnectionEvent::FrameDetected(frame) => Some(frame),
                _ => None,
            })
        })
    }

    /// Only filter matches.
    fn matches(self) -> impl Stream<Item = MatchEvent>
    where
        Self: Sized,
    {
        self.filter_map(|event| {
            future::ready(match event {
                ConnectionEvent::MatchFound(m) => Some(m),
                _ => None,
            })
        })
    }
}

impl<T: Stream<Item = ConnectionEvent>> EventStreamExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ByteRange, ConnectionState};
    use std::time::SystemTime;

    fn chunk(seq: u64) -> ConnectionEvent {
        ConnectionEvent::ByteChunkArrived {
            seq,
            range: ByteRange::at(seq, 1),
            timestamp: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_state() {
        let (tx, rx) = broadcast::channel(8);
        let mut stream = EventStream::new(rx);

        tx.send(chunk(0)).unwrap();
        tx.send(ConnectionEvent::StateChanged(ConnectionState::Closed)).unwrap();
        tx.send(chunk(1)).unwrap();

        assert!(matches!(stream.next().await, Some(ConnectionEvent::ByteChunkArrived { seq: 0, .. })));
        assert!(matches!(
            stream.next().await,
            Some(ConnectionEvent::StateChanged(ConnectionState::Closed))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_sees_lag_marker() {
        let (tx, rx) = broadcast::channel(2);
        let mut stream = EventStream::new(rx);
        for seq in 0..5 {
            tx.send(chunk(seq)).unwrap();
        }

        assert_eq!(stream.next().await, Some(ConnectionEvent::Lagged { missed: 3 }));
        assert!(matches!(stream.next().await, Some(ConnectionEvent::ByteChunkArrived { seq: 3, .. })));
    }
}

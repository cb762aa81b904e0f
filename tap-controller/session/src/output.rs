use linkerd_tap_controller_core::TapEvent;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::Arc,
    task::{Context, Poll, Waker},
};
use tokio_util::sync::CancellationToken;

/// Creates a bounded buffer between a session and its caller.
///
/// The buffer never applies backpressure. When a caller falls behind, the
/// oldest buffered event is displaced so that the caller sees the most recent
/// traffic once it catches up.
pub(crate) fn channel(capacity: usize) -> (Sender, Receiver) {
    let shared = Arc::new(Shared {
        capacity: capacity.max(1),
        state: Mutex::new(State {
            buf: VecDeque::with_capacity(capacity.max(1)),
            closed: false,
            rx_task: None,
        }),
        rx_dropped: CancellationToken::new(),
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

#[derive(Debug)]
pub(crate) struct Sender {
    shared: Arc<Shared>,
}

#[derive(Debug)]
pub(crate) struct Receiver {
    shared: Arc<Shared>,
}

/// The caller has gone away.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Closed(());

#[derive(Debug)]
struct Shared {
    capacity: usize,
    state: Mutex<State>,
    rx_dropped: CancellationToken,
}

#[derive(Debug)]
struct State {
    buf: VecDeque<TapEvent>,
    closed: bool,
    rx_task: Option<Waker>,
}

// === impl Sender ===

impl Sender {
    /// Buffers an event, returning the event it displaced, if any.
    pub(crate) fn send(&self, ev: TapEvent) -> Result<Option<TapEvent>, Closed> {
        if self.shared.rx_dropped.is_cancelled() {
            return Err(Closed(()));
        }

        let mut state = self.shared.state.lock();
        let displaced = if state.buf.len() >= self.shared.capacity {
            state.buf.pop_front()
        } else {
            None
        };
        state.buf.push_back(ev);
        let task = state.rx_task.take();
        drop(state);

        if let Some(task) = task {
            task.wake();
        }
        Ok(displaced)
    }

    /// Completes when the receiver is dropped.
    pub(crate) async fn closed(&self) {
        self.shared.rx_dropped.cancelled().await
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let task = state.rx_task.take();
        drop(state);
        if let Some(task) = task {
            task.wake();
        }
    }
}

// === impl Receiver ===

impl Receiver {
    /// Yields buffered events, then `None` once the sender is dropped and the
    /// buffer is empty.
    pub(crate) fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<TapEvent>> {
        let mut state = self.shared.state.lock();
        if let Some(ev) = state.buf.pop_front() {
            return Poll::Ready(Some(ev));
        }
        if state.closed {
            return Poll::Ready(None);
        }
        state.rx_task = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shared.rx_dropped.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkerd_tap_controller_core::{Direction, EventKind, StreamId, TargetId};
    use std::{future::poll_fn, time::SystemTime};

    fn event(n: u64) -> TapEvent {
        TapEvent {
            target: TargetId::new("ns", "web-0"),
            source: ([10, 0, 0, 1], 50000).into(),
            source_meta: Default::default(),
            destination: ([10, 0, 1, 1], 8080).into(),
            destination_meta: Default::default(),
            direction: Direction::Outbound,
            timestamp: SystemTime::UNIX_EPOCH,
            kind: EventKind::RequestInit {
                id: StreamId { base: 0, stream: n },
                method: http::Method::GET,
                scheme: None,
                authority: String::new(),
                path: format!("/{n}"),
                headers: vec![],
            },
        }
    }

    fn stream(ev: &TapEvent) -> u64 {
        ev.kind.stream_id().stream
    }

    #[tokio::test]
    async fn displaces_oldest_events() {
        let (tx, mut rx) = channel(2);
        assert_eq!(tx.send(event(0)), Ok(None));
        assert_eq!(tx.send(event(1)), Ok(None));

        let displaced = tx.send(event(2)).expect("receiver must be live");
        assert_eq!(displaced.as_ref().map(stream), Some(0));
        let displaced = tx.send(event(3)).expect("receiver must be live");
        assert_eq!(displaced.as_ref().map(stream), Some(1));

        drop(tx);
        let mut received = Vec::new();
        while let Some(ev) = poll_fn(|cx| rx.poll_recv(cx)).await {
            received.push(stream(&ev));
        }
        assert_eq!(received, vec![2, 3]);
    }

    #[tokio::test]
    async fn wakes_pending_receivers() {
        let (tx, mut rx) = channel(4);
        let recv = tokio::spawn(async move { poll_fn(|cx| rx.poll_recv(cx)).await });
        tokio::task::yield_now().await;

        tx.send(event(7)).expect("receiver must be live");
        let ev = recv.await.expect("task must complete");
        assert_eq!(ev.as_ref().map(stream), Some(7));
    }

    #[tokio::test]
    async fn reports_dropped_receivers() {
        let (tx, rx) = channel(4);
        drop(rx);
        tx.closed().await;
        assert_eq!(tx.send(event(0)), Err(Closed(())));
    }
}

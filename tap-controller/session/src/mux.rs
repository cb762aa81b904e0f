use crate::{
    metrics::{DropReason, SessionMetrics},
    output,
    registry::Registration,
};
use linkerd_tap_controller_core::{End, TapEvent};
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};

/// Merges events from all of a session's targets into the caller's output,
/// enforcing the session's rate and volume limits.
#[derive(Debug)]
pub(crate) struct Multiplexer {
    fan_in: mpsc::Receiver<TapEvent>,
    output: output::Sender,
    bucket: TokenBucket,
    limit: u32,

    /// The number of events that have been or will be delivered to the
    /// caller. Events displaced from the caller's buffer are not counted.
    emitted: u32,
    metrics: SessionMetrics,
}

/// Admits at most `rate` events per second, with bursts of up to one
/// second's worth of events.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    rate: f64,
    last: Instant,
}

// === impl Multiplexer ===

impl Multiplexer {
    pub(crate) fn new(
        fan_in: mpsc::Receiver<TapEvent>,
        output: output::Sender,
        max_rps: f64,
        limit: u32,
        metrics: SessionMetrics,
    ) -> Self {
        Self {
            fan_in,
            output,
            bucket: TokenBucket::new(max_rps, Instant::now()),
            limit,
            emitted: 0,
            metrics,
        }
    }

    /// Forwards events until the session ends, then tears the session down.
    ///
    /// Target streams are closed and the registration is released before the
    /// end reason is sent, so a caller that observes the end of a session
    /// never observes its resources.
    pub(crate) async fn run(
        mut self,
        registration: Registration,
        mut reconciler: AbortOnDropHandle<()>,
        cancel: CancellationToken,
        end_tx: oneshot::Sender<End>,
    ) {
        let shutdown = registration.shutdown().signaled();
        tokio::pin!(shutdown);

        let mut release = None;
        let mut reconciled = false;
        let end = loop {
            tokio::select! {
                biased;

                handle = &mut shutdown => {
                    release = Some(handle);
                    break End::ServerShutdown;
                }

                _ = self.output.closed() => break End::ClientCancelled,

                _ = &mut reconciler => {
                    reconciled = true;
                    break End::ResolverFailed;
                }

                Some(ev) = self.fan_in.recv() => {
                    if let Some(end) = self.admit(ev) {
                        break end;
                    }
                }
            }
        };
        tracing::debug!(reason = end.as_str(), emitted = self.emitted, "ending");

        cancel.cancel();
        drop(self.output);
        if !reconciled {
            let _ = reconciler.await;
        }
        self.metrics.session_ended(end);
        drop(registration);
        drop(release);

        tracing::info!(%end, "tap session ended");
        let _ = end_tx.send(end);
    }

    fn admit(&mut self, ev: TapEvent) -> Option<End> {
        if !self.bucket.try_acquire(Instant::now()) {
            self.metrics.event_dropped(DropReason::RateLimit);
            return None;
        }

        // The caller's buffer is never allowed to slow the session's targets.
        // Once the limit is reached nothing more is sent, so every counted
        // event reaches the caller.
        match self.output.send(ev) {
            Ok(None) => self.emitted += 1,
            Ok(Some(_displaced)) => self.metrics.event_dropped(DropReason::BufferFull),
            Err(output::Closed { .. }) => return Some(End::ClientCancelled),
        }
        (self.emitted >= self.limit).then_some(End::LimitReached)
    }
}

// === impl TokenBucket ===

impl TokenBucket {
    fn new(rate: f64, now: Instant) -> Self {
        let capacity = rate.max(1.0);
        Self {
            capacity,
            tokens: capacity,
            rate,
            last: now,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        if self.tokens < 1.0 {
            return false;
        }
        self.tokens -= 1.0;
        true
    }
}

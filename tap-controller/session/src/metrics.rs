use linkerd_tap_controller_core::End;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct SessionMetrics {
    active: Gauge,
    started: Counter,
    rejected: Family<ReasonLabels, Counter>,
    ended: Family<ReasonLabels, Counter>,
    events_emitted: Counter,
    events_dropped: Family<ReasonLabels, Counter>,
    targets_opened: Counter,
    target_failures: Family<ReasonLabels, Counter>,
}

/// Why an event was not delivered to a caller.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum DropReason {
    /// The session's rate limit was exhausted.
    RateLimit,
    /// The caller was not keeping up with the session's output.
    BufferFull,
    /// The session was not keeping up with its targets.
    FanInFull,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct ReasonLabels {
    reason: &'static str,
}

// === SessionMetrics ===

impl SessionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();

        reg.register(
            "sessions_active",
            "The number of tap sessions currently streaming events",
            metrics.active.clone(),
        );
        reg.register(
            "sessions_started",
            "Total number of tap sessions started",
            metrics.started.clone(),
        );
        reg.register(
            "sessions_rejected",
            "Total number of tap sessions rejected at admission",
            metrics.rejected.clone(),
        );
        reg.register(
            "sessions_ended",
            "Total number of tap sessions that have ended",
            metrics.ended.clone(),
        );
        reg.register(
            "events_emitted",
            "Total number of tap events delivered to callers",
            metrics.events_emitted.clone(),
        );
        reg.register(
            "events_dropped",
            "Total number of tap events dropped before delivery",
            metrics.events_dropped.clone(),
        );
        reg.register(
            "target_streams_opened",
            "Total number of proxy tap streams opened",
            metrics.targets_opened.clone(),
        );
        reg.register(
            "target_failures",
            "Total number of proxy tap streams that failed",
            metrics.target_failures.clone(),
        );

        metrics
    }

    pub fn active(&self) -> i64 {
        self.active.get()
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted.get()
    }

    pub(crate) fn session_registered(&self) {
        self.active.inc();
    }

    pub(crate) fn session_unregistered(&self) {
        self.active.dec();
    }

    pub(crate) fn session_started(&self) {
        self.started.inc();
    }

    pub(crate) fn session_rejected(&self, reason: &'static str) {
        self.rejected.get_or_create(&ReasonLabels { reason }).inc();
    }

    pub(crate) fn session_ended(&self, end: End) {
        self.ended
            .get_or_create(&ReasonLabels {
                reason: end.as_str(),
            })
            .inc();
    }

    pub(crate) fn event_emitted(&self) {
        self.events_emitted.inc();
    }

    pub(crate) fn event_dropped(&self, drop: DropReason) {
        let reason = match drop {
            DropReason::RateLimit => "rate_limit",
            DropReason::BufferFull => "buffer_full",
            DropReason::FanInFull => "fan_in_full",
        };
        self.events_dropped
            .get_or_create(&ReasonLabels { reason })
            .inc();
    }

    pub(crate) fn target_opened(&self) {
        self.targets_opened.inc();
    }

    pub(crate) fn target_failed(&self, reason: &'static str) {
        self.target_failures
            .get_or_create(&ReasonLabels { reason })
            .inc();
    }
}

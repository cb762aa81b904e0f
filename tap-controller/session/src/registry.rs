use crate::metrics::SessionMetrics;
use ahash::AHashMap as HashMap;
use linkerd_tap_controller_core::Error;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{task::AbortHandle, time};

/// Tracks active sessions, enforcing a ceiling on concurrency and
/// coordinating server shutdown.
#[derive(Clone, Debug)]
pub struct Registry(Arc<Inner>);

/// Holds a session's slot in the registry. Dropping it releases the slot.
#[derive(Debug)]
pub struct Registration {
    id: SessionId,
    shutdown: drain::Watch,
    registry: Registry,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

#[derive(Debug)]
struct Inner {
    max_sessions: usize,
    metrics: SessionMetrics,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    next_id: u64,

    /// Active sessions and, once spawned, a handle to abort the session's task.
    active: HashMap<SessionId, Option<AbortHandle>>,

    /// Both are taken when shutdown begins, after which registration fails.
    shutdown: Option<(drain::Signal, drain::Watch)>,
}

// === impl Registry ===

impl Registry {
    pub fn new(max_sessions: usize, metrics: SessionMetrics) -> Self {
        Self(Arc::new(Inner {
            max_sessions,
            metrics,
            state: Mutex::new(State {
                next_id: 0,
                active: HashMap::default(),
                shutdown: Some(drain::channel()),
            }),
        }))
    }

    pub fn register(&self) -> Result<Registration, Error> {
        let mut state = self.0.state.lock();

        let Some((_, watch)) = state.shutdown.as_ref() else {
            self.0.metrics.session_rejected("shutdown");
            return Err(Error::ServerShutdown);
        };
        let shutdown = watch.clone();

        if state.active.len() >= self.0.max_sessions {
            tracing::info!(
                active = state.active.len(),
                "rejecting tap session: too many active sessions"
            );
            self.0.metrics.session_rejected("too_many_sessions");
            return Err(Error::TooManyActiveSessions {
                max: self.0.max_sessions,
            });
        }

        let id = SessionId(state.next_id);
        state.next_id += 1;
        state.active.insert(id, None);
        self.0.metrics.session_registered();

        Ok(Registration {
            id,
            shutdown,
            registry: self.clone(),
        })
    }

    /// The number of sessions currently holding a registration.
    pub fn active(&self) -> usize {
        self.0.state.lock().active.len()
    }

    /// Associates a session's task with its registration so that it may be
    /// aborted if it does not shut down gracefully.
    pub(crate) fn track(&self, id: SessionId, task: AbortHandle) {
        if let Some(slot) = self.0.state.lock().active.get_mut(&id) {
            *slot = Some(task);
        }
    }

    /// Signals all sessions to end and waits for them to release their
    /// registrations.
    ///
    /// Sessions that have not completed within `grace` are aborted. New
    /// registrations are rejected once shutdown begins.
    pub async fn shutdown(&self, grace: time::Duration) {
        let Some((signal, watch)) = self.0.state.lock().shutdown.take() else {
            return;
        };
        drop(watch);

        tracing::info!(sessions = self.active(), "shutting down tap sessions");
        if time::timeout(grace, signal.drain()).await.is_ok() {
            tracing::debug!("all tap sessions completed");
            return;
        }

        let abandoned = self
            .0
            .state
            .lock()
            .active
            .values()
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        tracing::warn!(
            sessions = abandoned.len(),
            ?grace,
            "tap sessions did not complete in time; aborting"
        );
        for task in abandoned {
            task.abort();
        }
    }
}

// === impl Registration ===

impl Registration {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Returns a watch that is signaled when the server begins shutting down.
    ///
    /// Shutdown waits for this registration and any watches taken from it to
    /// be released.
    pub(crate) fn shutdown(&self) -> drain::Watch {
        self.shutdown.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let removed = self.registry.0.state.lock().active.remove(&self.id);
        if removed.is_some() {
            self.registry.0.metrics.session_unregistered();
            tracing::debug!(session = %self.id, "unregistered");
        }
    }
}

// === impl SessionId ===

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

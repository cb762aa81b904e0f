use std::net::SocketAddr;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that prevent a tap session from starting.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid tap criteria: {0}")]
    InvalidCriteria(String),

    #[error("too many active tap sessions (max {max}); retry later")]
    TooManyActiveSessions { max: usize },

    #[error("tap server is shutting down")]
    ServerShutdown,

    #[error(transparent)]
    Discovery(#[from] anyhow::Error),
}

/// Errors isolated to a single target's tap stream.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("failed to connect to {addr}: {source}")]
    DialFailed {
        addr: SocketAddr,
        #[source]
        source: BoxError,
    },

    #[error("tap stream broken: {0}")]
    StreamBroken(#[source] BoxError),
}

/// Describes why a tap session ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum End {
    /// The session delivered as many events as it was permitted.
    LimitReached,

    /// The caller stopped reading from the session.
    ClientCancelled,

    /// The server is shutting down. Callers may retry against another replica.
    ServerShutdown,

    /// Target discovery failed and the session can no longer track membership.
    ResolverFailed,
}

// === impl Error ===

impl Error {
    pub(crate) fn invalid(msg: impl std::fmt::Display) -> Self {
        Self::InvalidCriteria(msg.to_string())
    }
}

// === impl TargetError ===

impl TargetError {
    pub fn dial(addr: SocketAddr, source: impl Into<BoxError>) -> Self {
        Self::DialFailed {
            addr,
            source: source.into(),
        }
    }

    pub fn broken(source: impl Into<BoxError>) -> Self {
        Self::StreamBroken(source.into())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DialFailed { .. } => "dial",
            Self::StreamBroken(_) => "stream",
        }
    }
}

// === impl End ===

impl End {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LimitReached => "limit_reached",
            Self::ClientCancelled => "client_cancelled",
            Self::ServerShutdown => "server_shutdown",
            Self::ResolverFailed => "resolver_failed",
        }
    }
}

impl std::fmt::Display for End {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}

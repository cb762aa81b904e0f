use crate::TargetId;
use std::{collections::BTreeMap, net::SocketAddr, time::Duration, time::SystemTime};

/// A single decoded observation from a proxy's tap stream.
#[derive(Clone, Debug, PartialEq)]
pub struct TapEvent {
    /// The pod whose proxy emitted the event.
    pub target: TargetId,
    pub source: SocketAddr,
    pub source_meta: BTreeMap<String, String>,
    pub destination: SocketAddr,
    pub destination_meta: BTreeMap<String, String>,
    pub direction: Direction,
    /// When the proxy recorded the event.
    pub timestamp: SystemTime,
    pub kind: EventKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Identifies a request within a single proxy's tap stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId {
    /// Identifies the connection the request was received on.
    pub base: u32,
    pub stream: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    RequestInit {
        id: StreamId,
        method: http::Method,
        scheme: Option<String>,
        authority: String,
        path: String,
        headers: Vec<(String, String)>,
    },
    RequestEnd {
        id: StreamId,
        since_request_init: Duration,
        request_bytes: u64,
        eos: Option<Eos>,
    },
    ResponseInit {
        id: StreamId,
        since_request_init: Duration,
        http_status: u16,
        headers: Vec<(String, String)>,
    },
    ResponseEnd {
        id: StreamId,
        since_request_init: Duration,
        since_response_init: Duration,
        response_bytes: u64,
        eos: Option<Eos>,
    },
}

/// How a request or response stream ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Eos {
    GrpcStatus(u32),
    ResetErrorCode(u32),
}

// === impl EventKind ===

impl EventKind {
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::RequestInit { id, .. }
            | Self::RequestEnd { id, .. }
            | Self::ResponseInit { id, .. }
            | Self::ResponseEnd { id, .. } => *id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestInit { .. } => "request_init",
            Self::RequestEnd { .. } => "request_end",
            Self::ResponseInit { .. } => "response_init",
            Self::ResponseEnd { .. } => "response_end",
        }
    }
}

// === impl Direction ===

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

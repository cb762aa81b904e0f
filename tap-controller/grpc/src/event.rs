//! Conversions between tap events and their wire representation.

use crate::api::proxy as proto;
use linkerd_tap_controller_core::{Direction, Eos, EventKind, StreamId, TapEvent, TargetId};
use proto::tap_event::http;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Decodes an event from `target`'s proxy.
///
/// Events without a timestamp are stamped on receipt.
pub(crate) fn from_proto(target: &TargetId, ev: proto::TapEvent) -> Result<TapEvent, &'static str> {
    let direction = match ev.direction() {
        proto::Direction::Inbound => Direction::Inbound,
        proto::Direction::Outbound => Direction::Outbound,
        proto::Direction::Unknown => return Err("event has no direction"),
    };
    let source = addr_from_proto(ev.source.ok_or("event has no source")?)?;
    let destination = addr_from_proto(ev.destination.ok_or("event has no destination")?)?;
    let timestamp = match ev.timestamp_us {
        0 => SystemTime::now(),
        us => UNIX_EPOCH + Duration::from_micros(us),
    };

    let Some(proto::tap_event::Event::Http(proto::tap_event::Http { event: Some(event) })) =
        ev.event
    else {
        return Err("event has no HTTP event");
    };
    let kind = match event {
        http::Event::RequestInit(init) => EventKind::RequestInit {
            id: stream_id(init.id)?,
            method: ::http::Method::from_bytes(init.method.as_bytes())
                .map_err(|_| "event has an invalid method")?,
            scheme: Some(init.scheme).filter(|s| !s.is_empty()),
            authority: init.authority,
            path: init.path,
            headers: headers_from_proto(init.headers),
        },
        http::Event::RequestEnd(end) => EventKind::RequestEnd {
            id: stream_id(end.id)?,
            since_request_init: Duration::from_micros(end.since_request_init_us),
            request_bytes: end.request_bytes,
            eos: end.eos.and_then(eos_from_proto),
        },
        http::Event::ResponseInit(init) => EventKind::ResponseInit {
            id: stream_id(init.id)?,
            since_request_init: Duration::from_micros(init.since_request_init_us),
            http_status: u16::try_from(init.http_status)
                .map_err(|_| "event has an invalid status")?,
            headers: headers_from_proto(init.headers),
        },
        http::Event::ResponseEnd(end) => EventKind::ResponseEnd {
            id: stream_id(end.id)?,
            since_request_init: Duration::from_micros(end.since_request_init_us),
            since_response_init: Duration::from_micros(end.since_response_init_us),
            response_bytes: end.response_bytes,
            eos: end.eos.and_then(eos_from_proto),
        },
    };

    Ok(TapEvent {
        target: target.clone(),
        source,
        source_meta: ev.source_meta.into_iter().collect(),
        destination,
        destination_meta: ev.destination_meta.into_iter().collect(),
        direction,
        timestamp,
        kind,
    })
}

pub(crate) fn to_proto(ev: TapEvent) -> proto::TapEvent {
    let event = match ev.kind {
        EventKind::RequestInit {
            id,
            method,
            scheme,
            authority,
            path,
            headers,
        } => http::Event::RequestInit(http::RequestInit {
            id: Some(stream_id_to_proto(id)),
            method: method.to_string(),
            scheme: scheme.unwrap_or_default(),
            authority,
            path,
            headers: headers_to_proto(headers),
        }),
        EventKind::RequestEnd {
            id,
            since_request_init,
            request_bytes,
            eos,
        } => http::Event::RequestEnd(http::RequestEnd {
            id: Some(stream_id_to_proto(id)),
            since_request_init_us: micros(since_request_init),
            request_bytes,
            eos: eos.map(eos_to_proto),
        }),
        EventKind::ResponseInit {
            id,
            since_request_init,
            http_status,
            headers,
        } => http::Event::ResponseInit(http::ResponseInit {
            id: Some(stream_id_to_proto(id)),
            since_request_init_us: micros(since_request_init),
            http_status: http_status.into(),
            headers: headers_to_proto(headers),
        }),
        EventKind::ResponseEnd {
            id,
            since_request_init,
            since_response_init,
            response_bytes,
            eos,
        } => http::Event::ResponseEnd(http::ResponseEnd {
            id: Some(stream_id_to_proto(id)),
            since_request_init_us: micros(since_request_init),
            since_response_init_us: micros(since_response_init),
            response_bytes,
            eos: eos.map(eos_to_proto),
        }),
    };

    let direction = match ev.direction {
        Direction::Inbound => proto::Direction::Inbound,
        Direction::Outbound => proto::Direction::Outbound,
    };

    proto::TapEvent {
        source: Some(addr_to_proto(ev.source)),
        source_meta: ev.source_meta.into_iter().collect(),
        destination: Some(addr_to_proto(ev.destination)),
        destination_meta: ev.destination_meta.into_iter().collect(),
        direction: direction.into(),
        timestamp_us: ev
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(micros)
            .unwrap_or_default(),
        event: Some(proto::tap_event::Event::Http(proto::tap_event::Http {
            event: Some(event),
        })),
    }
}

fn addr_from_proto(addr: proto::TcpAddress) -> Result<SocketAddr, &'static str> {
    let port = u16::try_from(addr.port).map_err(|_| "address has an invalid port")?;
    let ip = match addr.ip.len() {
        4 => {
            let octets: [u8; 4] = addr.ip[..].try_into().map_err(|_| "invalid IPv4 address")?;
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = addr.ip[..].try_into().map_err(|_| "invalid IPv6 address")?;
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err("address has an invalid IP"),
    };
    Ok(SocketAddr::new(ip, port))
}

fn addr_to_proto(addr: SocketAddr) -> proto::TcpAddress {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    proto::TcpAddress {
        ip,
        port: addr.port().into(),
    }
}

fn stream_id(id: Option<http::StreamId>) -> Result<StreamId, &'static str> {
    let id = id.ok_or("event has no stream ID")?;
    Ok(StreamId {
        base: id.base,
        stream: id.stream,
    })
}

fn stream_id_to_proto(StreamId { base, stream }: StreamId) -> http::StreamId {
    http::StreamId { base, stream }
}

fn headers_from_proto(headers: Vec<proto::Header>) -> Vec<(String, String)> {
    headers.into_iter().map(|h| (h.name, h.value)).collect()
}

fn headers_to_proto(headers: Vec<(String, String)>) -> Vec<proto::Header> {
    headers
        .into_iter()
        .map(|(name, value)| proto::Header { name, value })
        .collect()
}

fn eos_from_proto(eos: proto::Eos) -> Option<Eos> {
    match eos.end? {
        proto::eos::End::GrpcStatusCode(code) => Some(Eos::GrpcStatus(code)),
        proto::eos::End::ResetErrorCode(code) => Some(Eos::ResetErrorCode(code)),
    }
}

fn eos_to_proto(eos: Eos) -> proto::Eos {
    let end = match eos {
        Eos::GrpcStatus(code) => proto::eos::End::GrpcStatusCode(code),
        Eos::ResetErrorCode(code) => proto::eos::End::ResetErrorCode(code),
    };
    proto::Eos { end: Some(end) }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, hashmap};

    #[test]
    fn decodes_response_end() {
        let ev = proto::TapEvent {
            source: Some(proto::TcpAddress {
                ip: vec![10, 0, 0, 1],
                port: 50000,
            }),
            source_meta: hashmap! { "pod".to_string() => "web-0".to_string() },
            destination: Some(proto::TcpAddress {
                ip: Ipv6Addr::LOCALHOST.octets().to_vec(),
                port: 8080,
            }),
            destination_meta: Default::default(),
            direction: proto::Direction::Inbound.into(),
            timestamp_us: 1_000_000,
            event: Some(proto::tap_event::Event::Http(proto::tap_event::Http {
                event: Some(http::Event::ResponseEnd(http::ResponseEnd {
                    id: Some(http::StreamId { base: 1, stream: 2 }),
                    since_request_init_us: 3_000,
                    since_response_init_us: 1_000,
                    response_bytes: 42,
                    eos: Some(proto::Eos {
                        end: Some(proto::eos::End::GrpcStatusCode(14)),
                    }),
                })),
            })),
        };

        let target = TargetId::new("ns", "web-0");
        let decoded = from_proto(&target, ev).expect("event must decode");
        assert_eq!(decoded.target, target);
        assert_eq!(decoded.source, "10.0.0.1:50000".parse().unwrap());
        assert_eq!(decoded.destination, "[::1]:8080".parse().unwrap());
        assert_eq!(
            decoded.source_meta,
            btreemap! { "pod".to_string() => "web-0".to_string() }
        );
        assert_eq!(decoded.direction, Direction::Inbound);
        assert_eq!(decoded.timestamp, UNIX_EPOCH + Duration::from_secs(1));
        assert_eq!(
            decoded.kind,
            EventKind::ResponseEnd {
                id: StreamId { base: 1, stream: 2 },
                since_request_init: Duration::from_millis(3),
                since_response_init: Duration::from_millis(1),
                response_bytes: 42,
                eos: Some(Eos::GrpcStatus(14)),
            }
        );

        // Re-encoding preserves everything the proxy sent.
        let encoded = to_proto(decoded);
        assert_eq!(encoded.timestamp_us, 1_000_000);
        assert_eq!(encoded.destination.map(|a| a.ip.len()), Some(16));
    }

    #[test]
    fn rejects_incomplete_events() {
        let target = TargetId::new("ns", "web-0");
        let addr = Some(proto::TcpAddress {
            ip: vec![10, 0, 0, 1],
            port: 80,
        });

        let no_direction = proto::TapEvent {
            source: addr.clone(),
            destination: addr.clone(),
            ..Default::default()
        };
        assert!(from_proto(&target, no_direction).is_err());

        let no_event = proto::TapEvent {
            source: addr.clone(),
            destination: addr.clone(),
            direction: proto::Direction::Outbound.into(),
            ..Default::default()
        };
        assert!(from_proto(&target, no_event).is_err());

        let bad_ip = proto::TapEvent {
            source: Some(proto::TcpAddress {
                ip: vec![10, 0, 1],
                port: 80,
            }),
            destination: addr,
            direction: proto::Direction::Outbound.into(),
            ..Default::default()
        };
        assert!(from_proto(&target, bad_ip).is_err());
    }
}

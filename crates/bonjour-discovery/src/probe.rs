//! Reachability probes
//!
//! A probe opens a transport connection to a discovered service and reports
//! the endpoint it actually reached. Dropping the event stream tears the probe
//! down.

use crate::types::ServiceRef;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Host part of a reached endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Name(String),
    Unknown,
}

/// Endpoint a probe reached once ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Host and port, with the interface the connection went out on
    HostPort {
        host: Host,
        port: u16,
        interface: Option<String>,
    },

    /// Any other endpoint shape (service reference, unix socket, ...)
    Opaque(String),
}

impl Endpoint {
    /// Endpoint for a connected socket address
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Endpoint::HostPort {
                host: Host::Ipv4(*v4.ip()),
                port: v4.port(),
                interface: None,
            },
            SocketAddr::V6(v6) => Endpoint::HostPort {
                host: Host::Ipv6(*v6.ip()),
                port: v6.port(),
                interface: interface_name(v6.scope_id()),
            },
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::HostPort { host, port, .. } => match host {
                Host::Ipv4(ip) => write!(f, "{}:{}", ip, port),
                Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, port),
                Host::Name(name) => write!(f, "{}:{}", name, port),
                Host::Unknown => write!(f, "<unknown>:{}", port),
            },
            Endpoint::Opaque(desc) => f.write_str(desc),
        }
    }
}

/// State reported by a running probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeEvent {
    /// Not reachable yet; the probe keeps trying
    Waiting(String),
    /// Connected to the given endpoint
    Ready(Endpoint),
    /// Gave up
    Failed(String),
}

/// Opens transport-level probes to discovered services
pub trait ReachabilityProbe: Send + Sync {
    /// Starts a probe. The stream ends after `Ready` or `Failed`.
    fn connect(&self, service: &ServiceRef) -> BoxStream<'static, ProbeEvent>;
}

/// Probe that confirms reachability with a TCP connection
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl TcpProbe {
    pub fn new() -> Self {
        Self
    }
}

enum Step {
    Lookup { host: String, port: u16 },
    Connect {
        candidates: VecDeque<SocketAddr>,
        last_error: Option<String>,
    },
    Done,
}

impl ReachabilityProbe for TcpProbe {
    fn connect(&self, service: &ServiceRef) -> BoxStream<'static, ProbeEvent> {
        let Some(port) = service.port else {
            return stream::iter([ProbeEvent::Failed(
                "service advertised no port".to_string(),
            )])
            .boxed();
        };

        let first = if !service.addresses.is_empty() {
            // IPv4 first; link-local IPv6 without a scope rarely connects
            let mut addresses = service.addresses.clone();
            addresses.sort_by_key(|ip| !ip.is_ipv4());
            Step::Connect {
                candidates: addresses
                    .into_iter()
                    .map(|ip| SocketAddr::new(ip, port))
                    .collect(),
                last_error: None,
            }
        } else if let Some(host) = service.hostname.clone() {
            Step::Lookup { host, port }
        } else {
            return stream::iter([ProbeEvent::Failed(
                "service advertised no address".to_string(),
            )])
            .boxed();
        };

        stream::unfold(first, |step| async move {
            match step {
                Step::Done => None,
                Step::Lookup { host, port } => {
                    let target = host.trim_end_matches('.').to_string();
                    let looked_up = lookup_host((target.as_str(), port)).await;
                    match looked_up {
                        Ok(addrs) => Some((
                            ProbeEvent::Waiting(format!("resolved {}", target)),
                            Step::Connect {
                                candidates: addrs.collect(),
                                last_error: None,
                            },
                        )),
                        Err(e) => Some((
                            ProbeEvent::Failed(format!("lookup of {} failed: {}", target, e)),
                            Step::Done,
                        )),
                    }
                }
                Step::Connect {
                    mut candidates,
                    last_error,
                } => match candidates.pop_front() {
                    None => Some((
                        ProbeEvent::Failed(
                            last_error.unwrap_or_else(|| "no candidate addresses".to_string()),
                        ),
                        Step::Done,
                    )),
                    Some(addr) => match TcpStream::connect(addr).await {
                        Ok(stream) => {
                            let reached = stream.peer_addr().unwrap_or(addr);
                            debug!(endpoint = %reached, "Probe connected");
                            Some((
                                ProbeEvent::Ready(Endpoint::from_socket_addr(reached)),
                                Step::Done,
                            ))
                        }
                        Err(e) => {
                            let reason = format!("{}: {}", addr, e);
                            Some((
                                ProbeEvent::Waiting(reason.clone()),
                                Step::Connect {
                                    candidates,
                                    last_error: Some(reason),
                                },
                            ))
                        }
                    },
                },
            }
        })
        .boxed()
    }
}

/// Name of the interface with the given index, if the platform knows it
#[cfg(unix)]
pub fn interface_name(index: u32) -> Option<String> {
    if index == 0 {
        return None;
    }

    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: buf holds IF_NAMESIZE bytes as if_indextoname requires
    let name = unsafe { libc::if_indextoname(index, buf.as_mut_ptr()) };
    if name.is_null() {
        return None;
    }

    // SAFETY: on success the buffer holds a NUL-terminated name
    let name = unsafe { std::ffi::CStr::from_ptr(name) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(not(unix))]
pub fn interface_name(_index: u32) -> Option<String> {
    None
}

/// Returns true for fe80::/10 addresses
pub fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

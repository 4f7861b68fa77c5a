//! Browse backends
//!
//! A browse backend turns a service type and domain into a stream of batched
//! add/remove/change events. [`MdnsBrowser`] is the production backend on
//! top of the `mdns-sd` daemon.

use crate::error::{DiscoveryError, Result};
use crate::types::{ServiceIdentity, ServiceRef};
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use mdns_sd::{ServiceDaemon, ServiceEvent as MdnsEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Maximum number of daemon events grouped into one batch
const MAX_BATCH: usize = 32;

/// One entry of a browse batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseChange {
    Added(ServiceRef),
    Removed(ServiceRef),
    Changed(ServiceRef),
}

impl BrowseChange {
    pub fn service(&self) -> &ServiceRef {
        match self {
            BrowseChange::Added(service)
            | BrowseChange::Removed(service)
            | BrowseChange::Changed(service) => service,
        }
    }
}

/// Item of a browse stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseUpdate {
    /// A batch of changes reported together
    Changes(Vec<BrowseChange>),

    /// The browse failed; no further updates follow
    Failed(String),
}

/// Stops a running browse
pub trait BrowseHandle: Send {
    fn stop(&self);
}

/// A started browse
pub struct BrowseSubscription {
    pub updates: BoxStream<'static, BrowseUpdate>,
    pub handle: Box<dyn BrowseHandle>,
}

/// Source of browse sessions
pub trait BrowseBackend: Send + Sync {
    /// Starts browsing. Returns once the request was submitted.
    fn start(&self, service_type: &str, domain: &str) -> Result<BrowseSubscription>;
}

/// Browse backend on the mDNS service daemon
pub struct MdnsBrowser {
    daemon: ServiceDaemon,
}

impl MdnsBrowser {
    /// Creates the backend and its mDNS daemon
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(|e| {
            DiscoveryError::MdnsInitFailed(format!("Failed to create mDNS daemon: {}", e))
        })?;

        debug!("mDNS daemon created");
        Ok(Self { daemon })
    }
}

impl BrowseBackend for MdnsBrowser {
    fn start(&self, service_type: &str, domain: &str) -> Result<BrowseSubscription> {
        let ty_domain = format!(
            "{}.{}.",
            service_type.trim_matches('.'),
            domain.trim_matches('.')
        );

        info!(service_type = %ty_domain, "Starting browser");

        let receiver = self
            .daemon
            .browse(&ty_domain)
            .map_err(|e| DiscoveryError::BrowseFailed {
                service_type: ty_domain.clone(),
                reason: e.to_string(),
            })?;

        let mut batcher = EventBatcher::new(ty_domain.clone());
        let updates = receiver
            .into_stream()
            .ready_chunks(MAX_BATCH)
            .filter_map(move |events| future::ready(batcher.convert(events)))
            .boxed();

        Ok(BrowseSubscription {
            updates,
            handle: Box::new(MdnsBrowseHandle {
                daemon: self.daemon.clone(),
                ty_domain,
            }),
        })
    }
}

impl Drop for MdnsBrowser {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon already shut down");
        }
    }
}

struct MdnsBrowseHandle {
    daemon: ServiceDaemon,
    ty_domain: String,
}

impl BrowseHandle for MdnsBrowseHandle {
    fn stop(&self) {
        match self.daemon.stop_browse(&self.ty_domain) {
            Ok(()) => debug!(service_type = %self.ty_domain, "Browser stopped"),
            Err(e) => warn!(service_type = %self.ty_domain, error = %e, "Failed to stop browser"),
        }
    }
}

/// Maps daemon events to browse changes. The daemon reports every resolve
/// of a service the same way, so the first one seen is an addition, later
/// ones that differ from the last seen are changes and repeats are dropped.
struct EventBatcher {
    ty_domain: String,
    known: HashMap<String, ServiceRef>,
}

impl EventBatcher {
    fn new(ty_domain: String) -> Self {
        Self {
            ty_domain,
            known: HashMap::new(),
        }
    }

    fn convert(&mut self, events: Vec<MdnsEvent>) -> Option<BrowseUpdate> {
        let mut changes = Vec::new();

        for event in events {
            match event {
                MdnsEvent::ServiceResolved(info) => {
                    debug!(
                        service = info.get_fullname(),
                        hostname = info.get_hostname(),
                        port = info.get_port(),
                        "Service resolved by daemon"
                    );

                    let Some(service) = self.service_ref(&info) else {
                        warn!(service = info.get_fullname(), "Unparseable service name");
                        continue;
                    };

                    match self.known.insert(info.get_fullname().to_string(), service.clone()) {
                        None => changes.push(BrowseChange::Added(service)),
                        Some(previous) if previous == service => {
                            debug!(service = info.get_fullname(), "Unchanged resolve skipped");
                        }
                        Some(_) => changes.push(BrowseChange::Changed(service)),
                    }
                }

                MdnsEvent::ServiceRemoved(typ, fullname) => {
                    debug!(service = fullname, typ = typ, "Service removed");

                    self.known.remove(&fullname);
                    if let Some(identity) = ServiceIdentity::from_fullname(&fullname, &self.ty_domain)
                    {
                        changes.push(BrowseChange::Removed(ServiceRef::new(identity)));
                    }
                }

                MdnsEvent::SearchStarted(typ) => {
                    debug!(typ = typ, "Search started");
                }

                MdnsEvent::SearchStopped(typ) => {
                    debug!(typ = typ, "Search stopped");
                }

                _ => {}
            }
        }

        if changes.is_empty() {
            None
        } else {
            Some(BrowseUpdate::Changes(changes))
        }
    }

    fn service_ref(&self, info: &ServiceInfo) -> Option<ServiceRef> {
        let identity = ServiceIdentity::from_fullname(info.get_fullname(), &self.ty_domain)?;
        let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
        addresses.sort();

        Some(
            ServiceRef::new(identity)
                .with_hostname(info.get_hostname())
                .with_addresses(addresses)
                .with_port(info.get_port()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TY_DOMAIN: &str = "_ipp._tcp.local.";

    fn info(instance: &str, ip: &str) -> ServiceInfo {
        ServiceInfo::new(
            TY_DOMAIN,
            instance,
            "printer.local.",
            ip,
            631,
            HashMap::<String, String>::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_first_resolve_is_added_then_changed() {
        let mut batcher = EventBatcher::new(TY_DOMAIN.to_string());

        let first = batcher
            .convert(vec![MdnsEvent::ServiceResolved(info("Office", "192.168.1.5"))])
            .unwrap();
        let BrowseUpdate::Changes(changes) = first else {
            panic!("expected changes");
        };
        assert!(matches!(changes.as_slice(), [BrowseChange::Added(_)]));

        let service = changes[0].service();
        assert_eq!(service.identity.name(), "Office");
        assert_eq!(service.port, Some(631));
        assert_eq!(service.addresses, vec!["192.168.1.5".parse::<IpAddr>().unwrap()]);

        let second = batcher
            .convert(vec![MdnsEvent::ServiceResolved(info("Office", "192.168.1.6"))])
            .unwrap();
        assert!(matches!(
            second,
            BrowseUpdate::Changes(ref changes) if matches!(changes.as_slice(), [BrowseChange::Changed(_)])
        ));
    }

    #[test]
    fn test_identical_resolve_is_skipped() {
        let mut batcher = EventBatcher::new(TY_DOMAIN.to_string());

        assert!(batcher
            .convert(vec![MdnsEvent::ServiceResolved(info("Office", "192.168.1.5"))])
            .is_some());
        assert!(batcher
            .convert(vec![MdnsEvent::ServiceResolved(info("Office", "192.168.1.5"))])
            .is_none());

        let moved = batcher
            .convert(vec![
                MdnsEvent::ServiceResolved(info("Office", "192.168.1.5")),
                MdnsEvent::ServiceResolved(info("Office", "192.168.1.7")),
            ])
            .unwrap();
        let BrowseUpdate::Changes(changes) = moved else {
            panic!("expected changes");
        };
        assert_eq!(changes.len(), 1);
        assert!(matches!(changes[0], BrowseChange::Changed(_)));
        assert_eq!(
            changes[0].service().addresses,
            vec!["192.168.1.7".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn test_removal_resets_known_state() {
        let mut batcher = EventBatcher::new(TY_DOMAIN.to_string());
        let fullname = format!("Office.{}", TY_DOMAIN);

        batcher.convert(vec![MdnsEvent::ServiceResolved(info("Office", "192.168.1.5"))]);
        let removed = batcher
            .convert(vec![MdnsEvent::ServiceRemoved(TY_DOMAIN.to_string(), fullname)])
            .unwrap();
        assert!(matches!(
            removed,
            BrowseUpdate::Changes(ref changes) if matches!(changes.as_slice(), [BrowseChange::Removed(_)])
        ));

        let again = batcher
            .convert(vec![MdnsEvent::ServiceResolved(info("Office", "192.168.1.5"))])
            .unwrap();
        assert!(matches!(
            again,
            BrowseUpdate::Changes(ref changes) if matches!(changes.as_slice(), [BrowseChange::Added(_)])
        ));
    }

    #[test]
    fn test_search_events_produce_no_batch() {
        let mut batcher = EventBatcher::new(TY_DOMAIN.to_string());
        let update = batcher.convert(vec![
            MdnsEvent::SearchStarted(TY_DOMAIN.to_string()),
            MdnsEvent::ServiceFound(TY_DOMAIN.to_string(), format!("Office.{}", TY_DOMAIN)),
        ]);
        assert!(update.is_none());
    }
}

//! DNS-SD service discovery, resolution and caching
//!
//! This crate keeps a live, deduplicated view of the services of one type
//! advertised on the local network:
//! - Browse for services via mDNS (RFC 6762/6763)
//! - Resolve each discovered service to a reachable IPv4/IPv6 address or
//!   host name and port, confirmed by a connection probe
//! - Cache resolved services for the lifetime of a scan session
//! - Notify subscribers of result, state and failure changes
//!
//! # Architecture
//!
//! A [`Scanner`] owns one session at a time. While scanning it:
//! 1. Consumes batches of add/remove/change events from a [`BrowseBackend`]
//! 2. Resolves new and changed services concurrently through an
//!    [`AddressResolver`], each attempt bounded by a timeout
//! 3. Commits each batch to the [`ServiceCache`] at once
//! 4. Notifies result observers once per batch that changed the cache
//!
//! Stopping cancels every in-flight resolution, stops the browse and clears
//! the cache.
//!
//! # Example
//!
//! ```no_run
//! use bonjour_core::ScanConfig;
//! use bonjour_discovery::{ScanOptions, Scanner};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> bonjour_discovery::Result<()> {
//!     let scanner = Scanner::with_mdns(ScanConfig::default())?;
//!
//!     let _results = scanner.listen_for_scan_results(|results| {
//!         println!("{} services", results.len());
//!     });
//!
//!     let found = scanner
//!         .scan_for(Duration::from_secs(5), "_http._tcp", "local", ScanOptions::default())
//!         .await?;
//!     println!("{:?}", found);
//!
//!     Ok(())
//! }
//! ```

pub mod browse;
pub mod cache;
pub mod error;
pub mod listeners;
pub mod probe;
pub mod resolver;
pub mod service;
pub mod types;

pub use browse::{
    BrowseBackend, BrowseChange, BrowseHandle, BrowseSubscription, BrowseUpdate, MdnsBrowser,
};
pub use cache::ServiceCache;
pub use error::{DiscoveryError, ResolveError, Result};
pub use listeners::{ListenerHandle, ListenerRegistry, SubscriptionId};
pub use probe::{Endpoint, Host, ProbeEvent, ReachabilityProbe, TcpProbe};
pub use resolver::{AddressResolver, ConcurrentResolver, SerializedResolver};
pub use service::Scanner;
pub use types::{
    Resolution, ResolvedAddress, ScanFailure, ScanOptions, ScanResult, ServiceIdentity,
    ServiceRef,
};

//! Common test utilities and fakes for integration tests

#![allow(dead_code)]

use async_channel::{Receiver, Sender};
use bonjour_core::ScanConfig;
use bonjour_discovery::{
    BrowseBackend, BrowseChange, BrowseHandle, BrowseSubscription, BrowseUpdate, DiscoveryError,
    Endpoint, Host, ListenerHandle, ProbeEvent, ReachabilityProbe, ScanFailure, ScanResult,
    Scanner, ServiceIdentity, ServiceRef,
};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SERVICE_TYPE: &str = "_http._tcp";
pub const DOMAIN: &str = "local";

/// Enables test log output once (`RUST_LOG=debug cargo test`)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Reference to a service of the test type
pub fn service(name: &str) -> ServiceRef {
    ServiceRef::new(ServiceIdentity::new(name, SERVICE_TYPE, Some(DOMAIN)))
}

/// Browse backend fed by the test through a channel
pub struct FakeBrowser {
    feed: Sender<BrowseUpdate>,
    updates: Receiver<BrowseUpdate>,
    fail_start: AtomicBool,
    starts: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl FakeBrowser {
    pub fn new() -> Arc<Self> {
        let (feed, updates) = async_channel::unbounded();
        Arc::new(Self {
            feed,
            updates,
            fail_start: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Makes the next `start` calls fail
    pub fn fail_on_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Delivers one batch
    pub fn push(&self, changes: Vec<BrowseChange>) {
        self.feed
            .try_send(BrowseUpdate::Changes(changes))
            .expect("browse feed closed");
    }

    pub fn added(&self, name: &str) {
        self.push(vec![BrowseChange::Added(service(name))]);
    }

    pub fn removed(&self, name: &str) {
        self.push(vec![BrowseChange::Removed(service(name))]);
    }

    pub fn changed(&self, name: &str) {
        self.push(vec![BrowseChange::Changed(service(name))]);
    }

    /// Reports a mid-session browse failure
    pub fn fail(&self, reason: &str) {
        self.feed
            .try_send(BrowseUpdate::Failed(reason.to_string()))
            .expect("browse feed closed");
    }

    /// Ends the update stream
    pub fn close(&self) {
        self.feed.close();
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct FakeHandle {
    stops: Arc<AtomicUsize>,
}

impl BrowseHandle for FakeHandle {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

impl BrowseBackend for FakeBrowser {
    fn start(&self, service_type: &str, _domain: &str) -> bonjour_discovery::Result<BrowseSubscription> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(DiscoveryError::BrowseFailed {
                service_type: service_type.to_string(),
                reason: "service unavailable".to_string(),
            });
        }

        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(BrowseSubscription {
            updates: self.updates.clone().boxed(),
            handle: Box::new(FakeHandle {
                stops: Arc::clone(&self.stops),
            }),
        })
    }
}

#[derive(Clone)]
struct Script {
    delay: Duration,
    event: ProbeEvent,
}

/// Probe answering per service name from a script. Unscripted services never
/// become ready.
#[derive(Default)]
pub struct FakeProbe {
    scripts: Mutex<HashMap<String, Script>>,
    connects: Mutex<HashMap<String, usize>>,
}

impl FakeProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Service becomes reachable at `ip:port` after `delay_ms`
    pub fn ready_v4(&self, name: &str, ip: [u8; 4], port: u16, delay_ms: u64) {
        self.script(
            name,
            delay_ms,
            ProbeEvent::Ready(Endpoint::HostPort {
                host: Host::Ipv4(Ipv4Addr::from(ip)),
                port,
                interface: None,
            }),
        );
    }

    /// Service probe fails after `delay_ms`
    pub fn failing(&self, name: &str, delay_ms: u64) {
        self.script(name, delay_ms, ProbeEvent::Failed("connection refused".to_string()));
    }

    pub fn script(&self, name: &str, delay_ms: u64, event: ProbeEvent) {
        self.scripts.lock().insert(
            name.to_string(),
            Script {
                delay: Duration::from_millis(delay_ms),
                event,
            },
        );
    }

    /// Number of probes opened for `name`
    pub fn connects(&self, name: &str) -> usize {
        self.connects.lock().get(name).copied().unwrap_or(0)
    }
}

impl ReachabilityProbe for FakeProbe {
    fn connect(&self, service: &ServiceRef) -> BoxStream<'static, ProbeEvent> {
        let name = service.identity.name().to_string();
        *self.connects.lock().entry(name.clone()).or_insert(0) += 1;

        match self.scripts.lock().get(&name).cloned() {
            Some(Script { delay, event }) => stream::once(async move {
                tokio::time::sleep(delay).await;
                event
            })
            .chain(stream::pending())
            .boxed(),
            None => stream::pending().boxed(),
        }
    }
}

/// Everything the three listener channels delivered
pub struct Recorder {
    pub results: Arc<Mutex<Vec<Vec<ScanResult>>>>,
    pub states: Arc<Mutex<Vec<bool>>>,
    pub failures: Arc<Mutex<Vec<ScanFailure>>>,
    handles: Vec<ListenerHandle>,
}

impl Recorder {
    pub fn attach(scanner: &Scanner) -> Self {
        let results = Arc::new(Mutex::new(Vec::new()));
        let states = Arc::new(Mutex::new(Vec::new()));
        let failures = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&results);
        let on_results =
            scanner.listen_for_scan_results(move |r: &[ScanResult]| sink.lock().push(r.to_vec()));
        let sink = Arc::clone(&states);
        let on_state = scanner.listen_for_scan_state(move |s: bool| sink.lock().push(s));
        let sink = Arc::clone(&failures);
        let on_fail = scanner.listen_for_scan_fail(move |f: ScanFailure| sink.lock().push(f));

        Self {
            results,
            states,
            failures,
            handles: vec![on_results, on_state, on_fail],
        }
    }

    pub fn results(&self) -> Vec<Vec<ScanResult>> {
        self.results.lock().clone()
    }

    pub fn states(&self) -> Vec<bool> {
        self.states.lock().clone()
    }

    pub fn failures(&self) -> Vec<ScanFailure> {
        self.failures.lock().clone()
    }

    pub fn detach(&self) {
        for handle in &self.handles {
            handle.remove();
        }
    }
}

/// Scanner on the fakes with default configuration
pub fn scanner(browser: &Arc<FakeBrowser>, probe: &Arc<FakeProbe>) -> Scanner {
    scanner_with(ScanConfig::default(), browser, probe)
}

pub fn scanner_with(config: ScanConfig, browser: &Arc<FakeBrowser>, probe: &Arc<FakeProbe>) -> Scanner {
    let browser: Arc<dyn BrowseBackend> = browser.clone();
    let probe: Arc<dyn ReachabilityProbe> = probe.clone();
    Scanner::new(config, browser, probe).expect("Failed to create scanner")
}

/// Lets spawned tasks run and the paused clock advance by `millis`
pub async fn settle(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}

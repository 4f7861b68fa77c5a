//! Scanner: the discovery session controller

use crate::browse::{BrowseBackend, BrowseChange, BrowseHandle, BrowseUpdate, MdnsBrowser};
use crate::cache::ServiceCache;
use crate::error::{DiscoveryError, ResolveError, Result};
use crate::listeners::{ListenerHandle, ListenerRegistry};
use crate::probe::{ReachabilityProbe, TcpProbe};
use crate::resolver::{self, AddressResolver};
use crate::types::{
    Resolution, ScanFailure, ScanOptions, ScanResult, ServiceIdentity, ServiceRef,
};
use bonjour_core::ScanConfig;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Discovers, resolves and caches services of one type at a time.
///
/// Cloning is cheap; clones share the same session, cache and listeners.
/// Dropping the last clone stops an active session.
#[derive(Clone)]
pub struct Scanner {
    inner: Arc<ScannerInner>,
}

struct ScannerInner {
    config: ScanConfig,
    browser: Arc<dyn BrowseBackend>,
    probe: Arc<dyn ReachabilityProbe>,
    cache: ServiceCache,
    listeners: ListenerRegistry,
    runtime: Handle,
    session: Mutex<SessionState>,
    next_session: AtomicU64,
}

enum SessionState {
    Idle,
    Scanning(DiscoverySession),
}

/// State of one scan-to-stop lifecycle
struct DiscoverySession {
    id: u64,
    handle: Box<dyn BrowseHandle>,
    resolver: Arc<dyn AddressResolver>,
    cancel: CancellationToken,
    resolve_timeout: Duration,

    /// Identities with a resolution in flight, with the generation that
    /// owns the result
    pending: HashMap<ServiceIdentity, u64>,
    next_generation: u64,
}

impl DiscoverySession {
    fn begin_resolution(&mut self, identity: &ServiceIdentity) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.pending.insert(identity.clone(), generation);
        generation
    }

    fn owns(&self, identity: &ServiceIdentity, generation: u64) -> bool {
        self.pending.get(identity) == Some(&generation)
    }

    fn teardown(&self) {
        self.cancel.cancel();
        self.resolver.cancel_all();
        self.handle.stop();
    }
}

/// Resolutions spawned by one browse batch
struct BatchJob {
    session_id: u64,
    services: Vec<(ServiceRef, u64)>,
    removed_any: bool,
    resolver: Arc<dyn AddressResolver>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl Scanner {
    /// Creates a scanner on the current tokio runtime
    pub fn new(
        config: ScanConfig,
        browser: Arc<dyn BrowseBackend>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<Self> {
        config.validate().map_err(DiscoveryError::InvalidConfig)?;

        let runtime =
            Handle::try_current().map_err(|e| DiscoveryError::NoRuntime(e.to_string()))?;
        let listeners = ListenerRegistry::new(&runtime);

        info!(
            strategy = config.resolve_strategy.description(),
            timeout_ms = config.address_resolve_timeout_ms,
            "Scanner created"
        );

        Ok(Self {
            inner: Arc::new(ScannerInner {
                config,
                browser,
                probe,
                cache: ServiceCache::new(),
                listeners,
                runtime,
                session: Mutex::new(SessionState::Idle),
                next_session: AtomicU64::new(1),
            }),
        })
    }

    /// Creates a scanner that browses with mDNS and probes over TCP
    pub fn with_mdns(config: ScanConfig) -> Result<Self> {
        let browser = MdnsBrowser::new()?;
        Self::new(config, Arc::new(browser), Arc::new(TcpProbe::new()))
    }

    /// Configuration the scanner was created with
    pub fn config(&self) -> &ScanConfig {
        &self.inner.config
    }

    /// Starts a session. Does nothing if one is already running.
    ///
    /// Returns once the browse request was submitted. When the browse cannot
    /// start, failure listeners get `DiscoveryFailed`, state listeners get
    /// `false` and the error is returned.
    pub fn scan(&self, service_type: &str, domain: &str, options: ScanOptions) -> Result<()> {
        if service_type.trim_matches('.').is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "service type must not be empty".to_string(),
            ));
        }
        if domain.trim_matches('.').is_empty() {
            return Err(DiscoveryError::InvalidConfig(
                "domain must not be empty".to_string(),
            ));
        }

        let resolve_timeout = options
            .address_resolve_timeout
            .unwrap_or_else(|| self.inner.config.address_resolve_timeout());
        if resolve_timeout.is_zero() {
            return Err(DiscoveryError::InvalidConfig(
                "address resolve timeout must be greater than 0".to_string(),
            ));
        }

        let mut state = self.inner.session.lock();
        if matches!(*state, SessionState::Scanning(_)) {
            debug!(service_type, "Already scanning");
            return Ok(());
        }

        let subscription = match self.inner.browser.start(service_type, domain) {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(service_type, domain, error = %e, "Failed to start browsing");
                self.inner.listeners.notify_failure(ScanFailure::DiscoveryFailed);
                self.inner.listeners.notify_state(false);
                return Err(match e {
                    e @ DiscoveryError::BrowseFailed { .. } => e,
                    other => DiscoveryError::BrowseFailed {
                        service_type: service_type.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        };

        let config = &self.inner.config;
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let resolver = resolver::for_strategy(
            config.resolve_strategy,
            config.timeout_clock,
            Arc::clone(&self.inner.probe),
            config.default_interface.clone(),
        );

        *state = SessionState::Scanning(DiscoverySession {
            id,
            handle: subscription.handle,
            resolver,
            cancel: cancel.clone(),
            resolve_timeout,
            pending: HashMap::new(),
            next_generation: 0,
        });
        self.inner.listeners.notify_state(true);
        drop(state);

        self.inner.runtime.spawn(consume(
            Arc::downgrade(&self.inner),
            id,
            cancel,
            subscription.updates,
        ));

        info!(
            session = id,
            service_type,
            domain,
            timeout_ms = resolve_timeout.as_millis() as u64,
            "Scanning started"
        );
        Ok(())
    }

    /// Scans for `duration` and returns what was resolved by then.
    ///
    /// The session is stopped afterwards, including one that was already
    /// running when this was called.
    pub async fn scan_for(
        &self,
        duration: Duration,
        service_type: &str,
        domain: &str,
        options: ScanOptions,
    ) -> Result<Vec<ScanResult>> {
        self.scan(service_type, domain, options)?;
        tokio::time::sleep(duration).await;

        let snapshot = self.inner.cache.get_all();
        self.stop();
        Ok(snapshot)
    }

    /// Ends the active session, if any
    pub fn stop(&self) {
        self.inner.stop_session();
    }

    pub fn is_scanning(&self) -> bool {
        matches!(*self.inner.session.lock(), SessionState::Scanning(_))
    }

    /// Snapshot of the currently resolved services
    pub fn results(&self) -> Vec<ScanResult> {
        self.inner.cache.get_all()
    }

    /// Registers a result observer. It is called once with the current
    /// results, then on every change.
    pub fn listen_for_scan_results(
        &self,
        observer: impl Fn(&[ScanResult]) + Send + Sync + 'static,
    ) -> ListenerHandle {
        // Commits enqueue under the session lock; taking it orders the replay
        let _state = self.inner.session.lock();
        self.inner
            .listeners
            .listen_results(Arc::new(observer), self.inner.cache.get_all())
    }

    /// Registers a state observer. It is called once with the current state.
    pub fn listen_for_scan_state(
        &self,
        observer: impl Fn(bool) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let state = self.inner.session.lock();
        let scanning = matches!(*state, SessionState::Scanning(_));
        self.inner.listeners.listen_state(Arc::new(observer), scanning)
    }

    /// Registers a failure observer
    pub fn listen_for_scan_fail(
        &self,
        observer: impl Fn(ScanFailure) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.inner.listeners.listen_failures(Arc::new(observer))
    }

    /// Waits until every notification issued so far reached its observers
    pub async fn flush(&self) {
        self.inner.listeners.flush().await;
    }
}

impl ScannerInner {
    fn stop_session(&self) -> bool {
        let mut state = self.session.lock();
        let session = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Scanning(session) => session,
            SessionState::Idle => return false,
        };

        session.teardown();
        self.cache.clear();
        self.listeners.notify_state(false);

        info!(session = session.id, "Scanning stopped");
        true
    }

    fn fail_session(&self, session_id: u64, reason: &str) {
        let mut state = self.session.lock();
        let session = match std::mem::replace(&mut *state, SessionState::Idle) {
            SessionState::Scanning(session) if session.id == session_id => session,
            other => {
                *state = other;
                return;
            }
        };

        error!(session = session_id, reason, "Discovery failed");
        session.teardown();
        self.cache.clear();
        self.listeners.notify_failure(ScanFailure::DiscoveryFailed);
        self.listeners.notify_state(false);
    }

    /// Sorts one browse batch into removals and resolutions
    fn process_batch(
        &self,
        session_id: u64,
        changes: Vec<BrowseChange>,
    ) -> Option<BatchJob> {
        let mut state = self.session.lock();
        let session = match &mut *state {
            SessionState::Scanning(session) if session.id == session_id => session,
            _ => return None,
        };

        let mut removed_any = false;
        let mut services: Vec<(ServiceRef, u64)> = Vec::new();

        for change in changes {
            match change {
                BrowseChange::Added(service) => {
                    let identity = &service.identity;
                    if self.cache.contains(identity) || session.pending.contains_key(identity) {
                        debug!(service = %identity, "Ignoring known service");
                        continue;
                    }
                    let generation = session.begin_resolution(identity);
                    services.push((service, generation));
                }
                BrowseChange::Removed(service) => {
                    let identity = &service.identity;
                    session.pending.remove(identity);
                    services.retain(|(queued, _)| &queued.identity != identity);
                    if self.cache.remove(identity).is_some() {
                        debug!(service = %identity, "Service removed");
                        removed_any = true;
                    }
                }
                BrowseChange::Changed(service) => {
                    let identity = &service.identity;
                    let generation = session.begin_resolution(identity);
                    services.retain(|(queued, _)| &queued.identity != identity);
                    services.push((service, generation));
                }
            }
        }

        if services.is_empty() {
            if removed_any {
                self.listeners.notify_results(self.cache.get_all());
            }
            return None;
        }

        debug!(
            session = session_id,
            count = services.len(),
            "Resolving batch"
        );
        Some(BatchJob {
            session_id,
            services,
            removed_any,
            resolver: Arc::clone(&session.resolver),
            cancel: session.cancel.clone(),
            timeout: session.resolve_timeout,
        })
    }

    fn report_failure(
        &self,
        session_id: u64,
        service: &ServiceRef,
        generation: u64,
        error: &ResolveError,
    ) {
        let Some(failure) = error.failure_kind() else {
            return;
        };

        let mut state = self.session.lock();
        let session = match &mut *state {
            SessionState::Scanning(session) if session.id == session_id => session,
            _ => return,
        };
        if !session.owns(&service.identity, generation) {
            return;
        }

        session.pending.remove(&service.identity);
        warn!(service = %service.identity, error = %error, "Resolution failed");
        self.listeners.notify_failure(failure);
    }

    /// Writes a finished batch to the cache and notifies once
    fn commit_batch(
        &self,
        session_id: u64,
        resolved: Vec<(ServiceRef, u64, Resolution)>,
        removed_any: bool,
    ) {
        let mut state = self.session.lock();
        let session = match &mut *state {
            SessionState::Scanning(session) if session.id == session_id => session,
            _ => {
                debug!(session = session_id, "Discarding batch of a stopped session");
                return;
            }
        };

        let mut records = Vec::with_capacity(resolved.len());
        for (service, generation, resolution) in resolved {
            if !session.owns(&service.identity, generation) {
                debug!(service = %service.identity, "Discarding superseded resolution");
                continue;
            }
            session.pending.remove(&service.identity);

            let record = ScanResult::from_resolution(service.identity.name(), &resolution);
            records.push((service.identity, record));
        }

        let changed = removed_any || !records.is_empty();
        self.cache.set_many(records);
        if changed {
            self.listeners.notify_results(self.cache.get_all());
        }
    }
}

impl Drop for ScannerInner {
    fn drop(&mut self) {
        if self.stop_session() {
            warn!("Scanner dropped while scanning");
        }
    }
}

/// Reads browse updates until the session ends
async fn consume(
    inner: Weak<ScannerInner>,
    session_id: u64,
    cancel: CancellationToken,
    mut updates: BoxStream<'static, BrowseUpdate>,
) {
    loop {
        let update = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            update = updates.next() => update,
        };

        let Some(scanner) = inner.upgrade() else {
            break;
        };

        match update {
            Some(BrowseUpdate::Changes(changes)) => {
                if let Some(job) = scanner.process_batch(session_id, changes) {
                    scanner.runtime.spawn(resolve_batch(Weak::clone(&inner), job));
                }
            }
            Some(BrowseUpdate::Failed(reason)) => {
                scanner.fail_session(session_id, &reason);
                break;
            }
            None => {
                scanner.fail_session(session_id, "browse stream ended");
                break;
            }
        }
    }

    debug!(session = session_id, "Browse consumer stopped");
}

/// Resolves one batch concurrently and commits it once every attempt ended
async fn resolve_batch(inner: Weak<ScannerInner>, job: BatchJob) {
    let BatchJob {
        session_id,
        services,
        removed_any,
        resolver,
        cancel,
        timeout,
    } = job;

    let attempts = services.into_iter().map(|(service, generation)| {
        let resolver = Arc::clone(&resolver);
        let inner = Weak::clone(&inner);
        async move {
            match resolver.resolve(&service, timeout).await {
                Ok(resolution) => Some((service, generation, resolution)),
                Err(e) => {
                    if let Some(scanner) = inner.upgrade() {
                        scanner.report_failure(session_id, &service, generation, &e);
                    }
                    None
                }
            }
        }
    });

    let outcomes = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!(session = session_id, "Batch cancelled");
            return;
        }
        outcomes = future::join_all(attempts) => outcomes,
    };

    if let Some(scanner) = inner.upgrade() {
        let resolved = outcomes.into_iter().flatten().collect();
        scanner.commit_batch(session_id, resolved, removed_any);
    }
}

//! Address resolution strategies
//!
//! A resolution attempt opens a reachability probe to the service and
//! classifies the endpoint it reached once ready. Every attempt is registered
//! in an in-flight registry for as long as it runs, so a session stop can
//! cancel all of them at once.
//!
//! Two strategies exist:
//! - [`ConcurrentResolver`] runs any number of attempts side by side
//! - [`SerializedResolver`] admits one attempt at a time through a
//!   single-permit semaphore; [`TimeoutClock`] picks whether the timeout
//!   covers the wait for the permit

use crate::error::ResolveError;
use crate::probe::{is_link_local, Endpoint, Host, ProbeEvent, ReachabilityProbe};
use crate::types::{Resolution, ResolvedAddress, ServiceIdentity, ServiceRef};
use async_trait::async_trait;
use bonjour_core::{ResolveStrategy, TimeoutClock};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Resolves discovered services to a reachable address and port
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Runs one resolution attempt. Completes with exactly one outcome no
    /// later than `timeout` after the attempt started.
    async fn resolve(
        &self,
        service: &ServiceRef,
        timeout: Duration,
    ) -> Result<Resolution, ResolveError>;

    /// Cancels every attempt currently in flight
    fn cancel_all(&self);

    /// Number of attempts currently in flight
    fn in_flight(&self) -> usize;
}

/// Builds the resolver for a configured strategy
pub fn for_strategy(
    strategy: ResolveStrategy,
    clock: TimeoutClock,
    probe: Arc<dyn ReachabilityProbe>,
    default_interface: impl Into<String>,
) -> Arc<dyn AddressResolver> {
    match strategy {
        ResolveStrategy::Concurrent => Arc::new(ConcurrentResolver::new(probe, default_interface)),
        ResolveStrategy::Serialized => {
            Arc::new(SerializedResolver::new(probe, default_interface, clock))
        }
    }
}

// Deadlines beyond this are treated as never firing
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Deadline `timeout` after `start`, saturating instead of overflowing
fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Attempt identifier within one registry
pub type AttemptId = u64;

#[derive(Debug, Default)]
struct InFlightRegistry {
    next_id: AtomicU64,
    attempts: Mutex<HashMap<AttemptId, CancellationToken>>,
}

impl InFlightRegistry {
    fn register(&self) -> InFlightGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.attempts.lock().insert(id, token.clone());
        InFlightGuard {
            registry: self,
            id,
            token,
        }
    }

    fn cancel_all(&self) {
        let drained: Vec<CancellationToken> = {
            let mut attempts = self.attempts.lock();
            attempts.drain().map(|(_, token)| token).collect()
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "Cancelling in-flight resolutions");
        }
        for token in drained {
            token.cancel();
        }
    }

    fn len(&self) -> usize {
        self.attempts.lock().len()
    }
}

/// Keeps an attempt registered until dropped
struct InFlightGuard<'a> {
    registry: &'a InFlightRegistry,
    id: AttemptId,
    token: CancellationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.attempts.lock().remove(&self.id);
    }
}

/// Resolver that runs attempts concurrently
pub struct ConcurrentResolver {
    probe: Arc<dyn ReachabilityProbe>,
    default_interface: String,
    registry: InFlightRegistry,
}

impl ConcurrentResolver {
    pub fn new(probe: Arc<dyn ReachabilityProbe>, default_interface: impl Into<String>) -> Self {
        Self {
            probe,
            default_interface: default_interface.into(),
            registry: InFlightRegistry::default(),
        }
    }
}

#[async_trait]
impl AddressResolver for ConcurrentResolver {
    async fn resolve(
        &self,
        service: &ServiceRef,
        timeout: Duration,
    ) -> Result<Resolution, ResolveError> {
        let deadline = deadline_after(Instant::now(), timeout);
        let guard = self.registry.register();
        debug!(service = %service.identity, attempt = guard.id, "Resolving service");

        drive(
            self.probe.as_ref(),
            service,
            &guard.token,
            deadline,
            timeout,
            &self.default_interface,
        )
        .await
    }

    fn cancel_all(&self) {
        self.registry.cancel_all();
    }

    fn in_flight(&self) -> usize {
        self.registry.len()
    }
}

/// Resolver that admits a single attempt at a time
pub struct SerializedResolver {
    probe: Arc<dyn ReachabilityProbe>,
    default_interface: String,
    clock: TimeoutClock,
    gate: Semaphore,
    registry: InFlightRegistry,
}

impl SerializedResolver {
    pub fn new(
        probe: Arc<dyn ReachabilityProbe>,
        default_interface: impl Into<String>,
        clock: TimeoutClock,
    ) -> Self {
        Self {
            probe,
            default_interface: default_interface.into(),
            clock,
            gate: Semaphore::new(1),
            registry: InFlightRegistry::default(),
        }
    }
}

#[async_trait]
impl AddressResolver for SerializedResolver {
    async fn resolve(
        &self,
        service: &ServiceRef,
        timeout: Duration,
    ) -> Result<Resolution, ResolveError> {
        let requested_at = Instant::now();

        // Registered before queueing so a stop also releases waiters
        let guard = self.registry.register();

        let acquire = async {
            match self.clock {
                TimeoutClock::FromRequest => {
                    tokio::select! {
                        biased;
                        _ = guard.token.cancelled() => Err(ResolveError::Cancelled),
                        _ = sleep_until(deadline_after(requested_at, timeout)) => {
                            Err(timeout_error(&service.identity, timeout))
                        }
                        permit = self.gate.acquire() => Ok(permit),
                    }
                }
                TimeoutClock::FromAcquisition => {
                    tokio::select! {
                        biased;
                        _ = guard.token.cancelled() => Err(ResolveError::Cancelled),
                        permit = self.gate.acquire() => Ok(permit),
                    }
                }
            }
        };

        let _permit = match acquire.await? {
            Ok(permit) => permit,
            Err(_) => {
                warn!(service = %service.identity, "Resolution gate closed");
                return Err(ResolveError::Cancelled);
            }
        };

        let deadline = match self.clock {
            TimeoutClock::FromRequest => deadline_after(requested_at, timeout),
            TimeoutClock::FromAcquisition => deadline_after(Instant::now(), timeout),
        };
        debug!(
            service = %service.identity,
            attempt = guard.id,
            waited_ms = requested_at.elapsed().as_millis() as u64,
            "Resolving service"
        );

        drive(
            self.probe.as_ref(),
            service,
            &guard.token,
            deadline,
            timeout,
            &self.default_interface,
        )
        .await
    }

    fn cancel_all(&self) {
        self.registry.cancel_all();
    }

    fn in_flight(&self) -> usize {
        self.registry.len()
    }
}

/// Runs one probe until the first of cancel, deadline or probe outcome
async fn drive(
    probe: &dyn ReachabilityProbe,
    service: &ServiceRef,
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    default_interface: &str,
) -> Result<Resolution, ResolveError> {
    let identity = &service.identity;
    let mut events = probe.connect(service);

    let outcome = async {
        while let Some(event) = events.next().await {
            match event {
                ProbeEvent::Waiting(reason) => {
                    debug!(service = %identity, reason = %reason, "Probe waiting");
                }
                ProbeEvent::Ready(endpoint) => {
                    return classify(identity, endpoint, default_interface);
                }
                ProbeEvent::Failed(reason) => {
                    warn!(service = %identity, reason = %reason, "Probe failed");
                    return Err(ResolveError::ProbeFailed {
                        service: identity.to_string(),
                        reason,
                    });
                }
            }
        }

        Err(ResolveError::ProbeFailed {
            service: identity.to_string(),
            reason: "probe ended without an outcome".to_string(),
        })
    };

    // Losing branches are dropped here, which tears the probe down
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResolveError::Cancelled),
        _ = sleep_until(deadline) => Err(timeout_error(identity, timeout)),
        result = outcome => result,
    };

    match &result {
        Ok(resolution) => debug!(
            service = %identity,
            address = %resolution.address,
            port = resolution.port,
            "Service resolved"
        ),
        Err(ResolveError::Timeout { .. }) => debug!(service = %identity, "Resolution timed out"),
        Err(ResolveError::Cancelled) => debug!(service = %identity, "Resolution cancelled"),
        Err(_) => {}
    }

    result
}

fn timeout_error(identity: &ServiceIdentity, timeout: Duration) -> ResolveError {
    ResolveError::Timeout {
        service: identity.to_string(),
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Classifies a reached endpoint into one address family
pub fn classify(
    identity: &ServiceIdentity,
    endpoint: Endpoint,
    default_interface: &str,
) -> Result<Resolution, ResolveError> {
    let (host, port, interface) = match endpoint {
        Endpoint::HostPort {
            host,
            port,
            interface,
        } => (host, port, interface),
        Endpoint::Opaque(desc) => {
            warn!(service = %identity, endpoint = %desc, "Unexpected endpoint format");
            return Err(ResolveError::ExtractionFailed {
                service: identity.to_string(),
                reason: format!("unsupported endpoint {}", desc),
            });
        }
    };

    let address = match host {
        Host::Ipv4(ip) => ResolvedAddress::Ipv4(ip.to_string()),
        Host::Ipv6(ip) => {
            let zone = is_link_local(&ip)
                .then(|| interface.unwrap_or_else(|| default_interface.to_string()));
            ResolvedAddress::Ipv6 {
                address: ip.to_string(),
                zone,
            }
        }
        Host::Name(name) => ResolvedAddress::Hostname(name),
        Host::Unknown => {
            warn!(service = %identity, "Unknown host type");
            return Err(ResolveError::ExtractionFailed {
                service: identity.to_string(),
                reason: "unknown host type".to_string(),
            });
        }
    };

    Ok(Resolution { address, port })
}

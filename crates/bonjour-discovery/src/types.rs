//! Types for discovered services, their identities and resolved records

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Stable deduplication key for one advertised service instance.
///
/// Two discovery events that describe the same logical service always produce
/// equal identities: service type and domain are stored without leading or
/// trailing dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceIdentity {
    name: String,
    service_type: String,
    domain: Option<String>,
}

impl ServiceIdentity {
    /// Creates an identity from its parts
    pub fn new(
        name: impl Into<String>,
        service_type: impl AsRef<str>,
        domain: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            service_type: normalize_label(service_type.as_ref()),
            domain: domain
                .map(normalize_label)
                .filter(|domain| !domain.is_empty()),
        }
    }

    /// Parses a DNS-SD full name (`instance._type._proto.domain.`) given the
    /// type-and-domain suffix it was browsed under.
    pub fn from_fullname(fullname: &str, ty_domain: &str) -> Option<Self> {
        let suffix = ty_domain.trim_start_matches('.');
        let instance = fullname.strip_suffix(suffix)?.strip_suffix('.')?;
        if instance.is_empty() {
            return None;
        }

        let labels: Vec<&str> = suffix.split('.').filter(|l| !l.is_empty()).collect();
        let proto = labels
            .iter()
            .position(|label| *label == "_tcp" || *label == "_udp")?;
        let service_type = labels[..=proto].join(".");
        let domain = labels[proto + 1..].join(".");

        Some(Self::new(instance, service_type, Some(&domain)))
    }

    /// Instance (display) name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Service type, e.g. `_http._tcp`
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Browse domain, if the platform reported one
    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    /// Key string in `name.type[.domain]` form
    pub fn key(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{}.{}.{}", self.name, self.service_type, domain),
            None => format!("{}.{}", self.name, self.service_type),
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn normalize_label(value: &str) -> String {
    value.trim_matches('.').to_string()
}

/// A discovered, not yet resolved, service as reported by the browse backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRef {
    /// Deduplication key
    pub identity: ServiceIdentity,

    /// Advertised host name, if known
    pub hostname: Option<String>,

    /// Candidate addresses advertised for the service
    pub addresses: Vec<IpAddr>,

    /// Advertised port, if known
    pub port: Option<u16>,
}

impl ServiceRef {
    /// Creates a reference carrying only an identity
    pub fn new(identity: ServiceIdentity) -> Self {
        Self {
            identity,
            hostname: None,
            addresses: Vec::new(),
            port: None,
        }
    }

    /// Sets the advertised host name
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Sets the candidate addresses
    pub fn with_addresses(mut self, addresses: impl IntoIterator<Item = IpAddr>) -> Self {
        self.addresses = addresses.into_iter().collect();
        self
    }

    /// Sets the advertised port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

/// Address family produced by one successful resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedAddress {
    /// Dotted-quad IPv4 literal
    Ipv4(String),

    /// IPv6 literal, with a zone for link-local scope
    Ipv6 {
        address: String,
        zone: Option<String>,
    },

    /// Resolved host name
    Hostname(String),

    /// Unrecognized shape
    Unknown,
}

impl ResolvedAddress {
    /// Returns true for the usable address families
    pub fn is_known(&self) -> bool {
        !matches!(self, ResolvedAddress::Unknown)
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAddress::Ipv4(addr) => f.write_str(addr),
            ResolvedAddress::Ipv6 {
                address,
                zone: Some(zone),
            } => write!(f, "{}%{}", address, zone),
            ResolvedAddress::Ipv6 { address, zone: None } => f.write_str(address),
            ResolvedAddress::Hostname(name) => f.write_str(name),
            ResolvedAddress::Unknown => f.write_str("unknown"),
        }
    }
}

/// Output of a successful resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub address: ResolvedAddress,
    pub port: u16,
}

/// Externally visible resolved-service record.
///
/// Exactly one of `ipv4`/`ipv6`/`hostname` is set for records produced by
/// resolution. Serializes to `{name, ipv4?, ipv6?, hostname?, port?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ScanResult {
    /// Merges a display name with a resolved address and port
    pub fn from_resolution(name: impl Into<String>, resolution: &Resolution) -> Self {
        let mut result = Self {
            name: name.into(),
            ipv4: None,
            ipv6: None,
            hostname: None,
            port: Some(resolution.port),
        };

        match &resolution.address {
            ResolvedAddress::Ipv4(addr) => result.ipv4 = Some(addr.clone()),
            ResolvedAddress::Ipv6 { .. } => result.ipv6 = Some(resolution.address.to_string()),
            ResolvedAddress::Hostname(name) => result.hostname = Some(name.clone()),
            ResolvedAddress::Unknown => {}
        }

        result
    }

    /// Returns the connection string (host:port), bracketing IPv6 literals
    pub fn connection_string(&self) -> Option<String> {
        let port = self.port?;
        if let Some(ipv4) = &self.ipv4 {
            Some(format!("{}:{}", ipv4, port))
        } else if let Some(ipv6) = &self.ipv6 {
            Some(format!("[{}]:{}", ipv6, port))
        } else {
            self.hostname
                .as_ref()
                .map(|hostname| format!("{}:{}", hostname, port))
        }
    }
}

/// Failure kinds delivered to failure listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanFailure {
    /// Browse could not start or failed mid-session
    DiscoveryFailed,

    /// A service's resolution timed out or its probe failed
    ResolveFailed,

    /// A probe became ready on an unusable endpoint
    ExtractionFailed,
}

impl ScanFailure {
    /// Returns a human-readable description
    pub fn description(&self) -> &str {
        match self {
            ScanFailure::DiscoveryFailed => "Service discovery failed",
            ScanFailure::ResolveFailed => "Service address resolution failed",
            ScanFailure::ExtractionFailed => "Failed to extract IP and port information",
        }
    }
}

impl fmt::Display for ScanFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Per-call scan options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOptions {
    /// Per-attempt resolution timeout; falls back to the configured default
    pub address_resolve_timeout: Option<Duration>,
}

impl ScanOptions {
    /// Sets the resolution timeout in milliseconds
    pub fn with_address_resolve_timeout_ms(mut self, millis: u64) -> Self {
        self.address_resolve_timeout = Some(Duration::from_millis(millis));
        self
    }
}

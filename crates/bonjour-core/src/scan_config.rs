//! Configuration types for service scanning

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a discovery session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Service type to browse for (e.g. `_http._tcp`)
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Browse domain
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Per-attempt address resolution timeout (milliseconds)
    #[serde(default = "default_address_resolve_timeout")]
    pub address_resolve_timeout_ms: u64,

    /// Resolution strategy selected at session start
    #[serde(default)]
    pub resolve_strategy: ResolveStrategy,

    /// When the timeout clock starts for serialized resolution
    #[serde(default)]
    pub timeout_clock: TimeoutClock,

    /// Zone suffix for link-local IPv6 addresses when no interface is reported
    #[serde(default = "default_interface")]
    pub default_interface: String,

    /// Duration of a one-shot scan (seconds)
    #[serde(default = "default_scan_duration")]
    pub scan_duration_secs: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            domain: default_domain(),
            address_resolve_timeout_ms: default_address_resolve_timeout(),
            resolve_strategy: ResolveStrategy::default(),
            timeout_clock: TimeoutClock::default(),
            default_interface: default_interface(),
            scan_duration_secs: default_scan_duration(),
        }
    }
}

impl ScanConfig {
    /// Returns the address resolve timeout as a Duration
    pub fn address_resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.address_resolve_timeout_ms)
    }

    /// Returns the one-shot scan duration as a Duration
    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_secs)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.service_type.trim().is_empty() {
            return Err("service_type cannot be empty".to_string());
        }

        if self.domain.trim().is_empty() {
            return Err("domain cannot be empty".to_string());
        }

        if self.address_resolve_timeout_ms == 0 {
            return Err("address_resolve_timeout_ms must be greater than 0".to_string());
        }

        if self.default_interface.trim().is_empty() {
            return Err("default_interface cannot be empty".to_string());
        }

        Ok(())
    }
}

/// How address resolution attempts are scheduled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStrategy {
    /// Every attempt runs independently
    #[default]
    Concurrent,

    /// Attempts pass through a single-flight gate, one at a time
    Serialized,
}

impl ResolveStrategy {
    /// Returns a human-readable description
    pub fn description(&self) -> &str {
        match self {
            ResolveStrategy::Concurrent => "Concurrent resolution",
            ResolveStrategy::Serialized => "Single-flight resolution",
        }
    }
}

/// Start point of the per-attempt timeout under serialized resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutClock {
    /// Clock starts when the attempt asks for the gate; waiting counts
    #[default]
    FromRequest,

    /// Clock starts once the gate is held
    FromAcquisition,
}

// Default configuration values
fn default_service_type() -> String {
    "_http._tcp".to_string()
}

fn default_domain() -> String {
    "local".to_string()
}

fn default_address_resolve_timeout() -> u64 {
    10_000
}

fn default_interface() -> String {
    "en0".to_string()
}

fn default_scan_duration() -> u64 {
    5
}

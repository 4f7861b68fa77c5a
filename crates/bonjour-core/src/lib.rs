//! # Bonjour Core
//!
//! Configuration and error types shared by the discovery engine and the
//! `bonjour-scan` binary.
//!
//! - **Configuration**: [`AppConfig`] groups the scan settings
//!   ([`ScanConfig`]) and logging settings ([`LoggingConfig`]). It loads from
//!   YAML or through the `config` crate with `BONJOUR__*` environment
//!   overrides.
//! - **Errors**: [`CoreError`] and [`ConfigError`] cover loading and
//!   validation failures.
//!
//! ## Example
//!
//! ```
//! use bonjour_core::{AppConfig, ResolveStrategy};
//!
//! let config = AppConfig::from_yaml(
//!     "scan:\n  service_type: _ipp._tcp\n  resolve_strategy: serialized\n",
//! )
//! .unwrap();
//!
//! assert_eq!(config.scan.service_type, "_ipp._tcp");
//! assert_eq!(config.scan.resolve_strategy, ResolveStrategy::Serialized);
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod scan_config;

pub use config::{AppConfig, LogFormat, LoggingConfig};
pub use error::{ConfigError, CoreError, Result};
pub use scan_config::{ResolveStrategy, ScanConfig, TimeoutClock};

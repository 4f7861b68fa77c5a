//! Configuration loading from the shipped example file

use bonjour_core::{AppConfig, LogFormat, ResolveStrategy, TimeoutClock};
use std::path::PathBuf;
use std::time::Duration;

fn example_config() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("config")
        .join("bonjour.yaml")
}

#[test]
fn test_example_config_from_file() {
    let config = AppConfig::from_file(example_config()).expect("Failed to load example config");

    assert!(config.validate().is_ok());
    assert_eq!(config.scan.service_type, "_http._tcp");
    assert_eq!(config.scan.domain, "local");
    assert_eq!(config.scan.address_resolve_timeout(), Duration::from_secs(10));
    assert_eq!(config.scan.resolve_strategy, ResolveStrategy::Concurrent);
    assert_eq!(config.scan.timeout_clock, TimeoutClock::FromRequest);
    assert_eq!(config.logging.format, LogFormat::Text);
}

#[test]
fn test_example_config_through_layered_loader() {
    let config = AppConfig::load(Some(example_config())).expect("Failed to load example config");

    assert_eq!(config.scan.default_interface, "en0");
    assert_eq!(config.scan.scan_duration(), Duration::from_secs(5));
}

#[test]
fn test_missing_file_is_an_error() {
    let missing = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config").join("missing.yaml");
    assert!(AppConfig::load(Some(missing)).is_err());
}

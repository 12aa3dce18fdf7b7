//! Tests for runtime configuration loading and validation

use crate::config::RuntimeConfig;
use crate::error::RuntimeError;
use std::io::Write;

#[test]
fn test_default_values() {
    let config = RuntimeConfig::default();
    assert_eq!(config.default_timeout_seconds, 30.0);
    assert_eq!(config.preempt_interval_us, 50_000);
    assert_eq!(config.max_sleep_ms, 100);
    assert!(config.validate().is_ok());
}

#[test]
fn test_from_toml_fills_defaults() {
    let config = RuntimeConfig::from_toml_str("default_timeout_seconds = 2.5\n").unwrap();
    assert_eq!(config.default_timeout_seconds, 2.5);
    assert_eq!(config.preempt_interval_us, 50_000);
    assert_eq!(config.max_sleep_ms, 100);
}

#[test]
fn test_from_toml_rejects_garbage() {
    let result = RuntimeConfig::from_toml_str("default_timeout_seconds = \"soon\"\n");
    assert!(matches!(result, Err(RuntimeError::Config(_))));
}

#[test]
fn test_validate_rejects_nonpositive_timeout() {
    let config = RuntimeConfig {
        default_timeout_seconds: 0.0,
        ..RuntimeConfig::default()
    };
    assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));

    let config = RuntimeConfig {
        default_timeout_seconds: f64::INFINITY,
        ..RuntimeConfig::default()
    };
    assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
}

#[test]
fn test_validate_rejects_bad_max_sleep() {
    let config = RuntimeConfig {
        max_sleep_ms: 0,
        ..RuntimeConfig::default()
    };
    assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));

    let config = RuntimeConfig {
        max_sleep_ms: 120_000,
        ..RuntimeConfig::default()
    };
    assert!(matches!(config.validate(), Err(RuntimeError::Config(_))));
}

#[test]
fn test_load_from_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("runtime.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "default_timeout_seconds = 5.0").unwrap();
    writeln!(file, "max_sleep_ms = 20").unwrap();

    let config = RuntimeConfig::load_from_file(&path).unwrap();
    assert_eq!(config.default_timeout_seconds, 5.0);
    assert_eq!(config.max_sleep_ms, 20);
}

#[test]
fn test_load_from_missing_file() {
    let result = RuntimeConfig::load_from_file("/nonexistent/runtime.toml");
    assert!(matches!(result, Err(RuntimeError::Config(_))));
}

#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Installs the global subscriber, so it lives in its own test binary.

use busrpc::logging::{init_logging, LogConfig};

#[test]
fn test_init_once_then_reject() {
    let config = LogConfig::default_dev();
    let guard = init_logging(&config).unwrap();
    tracing::info!(component = "logging_tests", "Subscriber installed");

    let err = init_logging(&config).unwrap_err();
    assert!(err.to_string().contains("Failed to initialize logging"));
    drop(guard);
}

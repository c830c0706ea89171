#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use busrpc::{Dispatcher, MemoryBus, RuntimeConfig};

/// Defaults with short timeouts so failing cases finish quickly.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        handler_timeout_ms: 2_000,
        request_timeout_ms: 2_000,
        ..RuntimeConfig::default()
    }
}

/// A fresh in-memory bus plus a dispatcher bound to it.
pub fn setup() -> (MemoryBus, Dispatcher) {
    setup_with(test_config())
}

pub fn setup_with(config: RuntimeConfig) -> (MemoryBus, Dispatcher) {
    let bus = MemoryBus::new();
    let dispatcher = Dispatcher::new(Arc::new(bus.clone()), config);
    (bus, dispatcher)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

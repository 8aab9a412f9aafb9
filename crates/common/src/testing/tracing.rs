//! Tracing setup for tests

use std::sync::Once;

use crate::observability::{init_tracing, LoggingConfig};

static INIT: Once = Once::new();

/// Install a test subscriber once per process
///
/// Output is captured by the test harness; set `RUST_LOG` to see it for a
/// failing test.
pub fn init_test_tracing() {
    INIT.call_once(|| {
        let config = LoggingConfig { filter: "warn".to_string(), ..LoggingConfig::default() };
        // An invalid RUST_LOG only disables test logging
        let _ = init_tracing(&config);
    });
}

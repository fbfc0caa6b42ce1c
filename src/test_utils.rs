//! Test utilities and global setup
//!
//! Provides centralized test logging configuration.

/// Test logging utilities
#[cfg(all(test, feature = "test-logging"))]
pub mod logging {
    use std::sync::Once;
    use tracing_subscriber::{EnvFilter, fmt};

    static INIT: Once = Once::new();

    /// Initialize test logging globally - safe to call multiple times
    ///
    /// Test modules opt in through the macro, which installs a constructor
    /// that runs before any test:
    /// ```rust,ignore
    /// #[cfg(feature = "test-logging")]
    /// crate::setup_test_logging!();
    /// ```
    ///
    /// ```bash
    /// # RCON wire traffic while testing the gateway
    /// RUST_LOG=mc_console_relay::rcon=trace cargo test --features test-logging gateway
    /// ```
    pub fn init() {
        INIT.call_once(|| {
            let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Default filter: debug for our crate, info for the HTTP stack
                EnvFilter::new("debug,tokio=info,hyper=info,hyper_util=info,reqwest=info")
            });

            fmt()
                .with_env_filter(env_filter)
                .with_test_writer()
                .with_target(true)
                .with_thread_ids(true)
                .compact()
                .try_init()
                .ok(); // Another test binary thread may have won the race
        });
    }
}

/// Install the test logger for every test in the invoking module
#[cfg(all(test, feature = "test-logging"))]
#[macro_export]
macro_rules! setup_test_logging {
    () => {
        #[ctor::ctor]
        fn init_test_logging() {
            $crate::test_utils::logging::init();
        }
    };
}

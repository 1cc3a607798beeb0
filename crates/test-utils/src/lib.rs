pub mod builders;
pub mod fake_cloud;
pub mod faulty_fs;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Upper bound for anything a test awaits. Tests spawn real `sh` processes.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Install a test-writer subscriber once per test binary.
///
/// Output is captured per test and shown only for failures. `RUST_LOG` or
/// `PIPEWORKS_LOG` select the filter, e.g. `PIPEWORKS_LOG=pipeworks=trace`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_from_env("PIPEWORKS_LOG"))
            .unwrap_or_else(|_| EnvFilter::new("warn,pipeworks=info"));

        // Another subscriber may already be installed by a unit test helper.
        let _ = fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .try_init();
    });
}

/// Await `f`, panicking if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(value) => value,
        Err(_) => panic!("test timed out after {TEST_TIMEOUT:?}"),
    }
}

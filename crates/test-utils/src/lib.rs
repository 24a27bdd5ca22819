pub mod builders;
pub mod fake_drm;

pub use builders::{StageConfigBuilder, WorkflowFileBuilder};
pub use fake_drm::{FakeDrm, SubmissionRecord};

use std::sync::Once;
use std::time::Duration;

use drmflow::drm::DrmRegistry;
use drmflow::engine::RunOptions;
use tracing_subscriber::{EnvFilter, fmt};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_target(true)
            .init();
    });
}

/// Run a future with a 10-second timeout.
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(10), f)
        .await
        .expect("Test timed out after 10 seconds")
}

/// Run options with a short poll interval, for fake backends.
pub fn fast_options() -> RunOptions {
    RunOptions::default().poll_interval(Duration::from_millis(5))
}

/// Registry holding just `drm`.
pub fn registry_with(drm: &FakeDrm) -> DrmRegistry {
    DrmRegistry::new().with(drm.handle())
}

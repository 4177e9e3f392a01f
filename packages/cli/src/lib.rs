// ABOUTME: Process bootstrap for the sandcastle binary
// ABOUTME: Logging setup and wiring of storage, sandbox, container runtime and orchestrator

pub mod app;
pub mod progress;

pub use app::App;
pub use progress::ProgressPrinter;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, honouring RUST_LOG and defaulting to `info`
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

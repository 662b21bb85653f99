//! Tracing/logging initialization.
//!
//! `RUST_LOG` controls filtering (default `info`); `CALLPIPE_LOG_FORMAT`
//! selects `json` (default) or `pretty` output.

use tracing_subscriber::EnvFilter;

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        Self::parse(std::env::var("CALLPIPE_LOG_FORMAT").ok().as_deref())
    }

    fn parse(raw: Option<&str>) -> Self {
        match raw.map(|r| r.trim().to_ascii_lowercase()) {
            Some(r) if r == "pretty" || r == "text" => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(service_name: &str, format: LogFormat) {
    let installed = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .with_thread_names(true)
            .try_init()
            .is_ok(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_thread_names(true)
            .try_init()
            .is_ok(),
    };

    if installed {
        ::tracing::info!(service = service_name, ?format, "logging initialised");
    }
}

/// Route logs through the libtest capture so they only show for failing tests.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .with_thread_names(true)
        .try_init();
}

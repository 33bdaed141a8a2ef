use tracing_subscriber::prelude::*;

const DEFAULT_FILTER: &str = "murmur_core=debug,info";

/// Logging initialization, called once at the start of `ChatApp::new()`.
///
/// Writes to stderr and, when the data dir is writable, to `<data_dir>/murmur.log`.
/// `RUST_LOG` overrides the default filter. A subscriber installed earlier (by a test or the
/// embedding binary) wins.
pub fn init_logging(data_dir: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let log_path = std::path::Path::new(data_dir).join("murmur.log");
    let _ = std::fs::create_dir_all(data_dir);
    let file_layer = if let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .with_target(true),
        )
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init();
}

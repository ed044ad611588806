use std::fs;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogConfig;

pub const LOG_FILE_NAME: &str = "parley.log";

/// Installs the global subscriber: `RUST_LOG` wins over the configured
/// level, output goes to `<log dir>/parley.log` and optionally to stderr.
/// Failures only print a warning; the chat still runs without logs.
pub fn init_tracing(config: &LogConfig) {
    static TRACE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    if let Err(error) = fs::create_dir_all(&config.dir) {
        eprintln!(
            "warning: failed to create log dir {}: {error}",
            config.dir.display()
        );
        return;
    }
    let appender = tracing_appender::rolling::never(&config.dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);
    let _ = TRACE_GUARD.set(guard);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);
    let init_result = if config.stderr {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::io::stderr);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
    };
    if let Err(error) = init_result {
        eprintln!(
            "warning: failed to initialize tracing subscriber for {}: {error}",
            config.dir.join(LOG_FILE_NAME).display()
        );
    }
}

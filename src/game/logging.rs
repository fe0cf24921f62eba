//! Tracing subscriber setup.
//!
//! Log verbosity comes from `RUST_LOG` via the env filter; pass a directory
//! to also write a timestamped log file. Simulation code only ever emits
//! through `tracing` macros and never reads logging state back.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// A guard that must be kept alive for the file appender to keep flushing.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Installs the global subscriber. Safe to call once per process.
pub fn init_logging(log_dir: Option<&std::path::Path>) -> LoggingGuard {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let file_name = format!(
                "kestrel-{}.log",
                chrono::Local::now().format("%Y%m%d-%H%M%S")
            );
            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            LoggingGuard {
                _file_guard: Some(guard),
            }
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer())
                .init();
            LoggingGuard { _file_guard: None }
        }
    }
}

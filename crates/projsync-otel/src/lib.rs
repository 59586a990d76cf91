use once_cell::sync::OnceCell;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Full,
    Compact,
    Pretty,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("PROJSYNC_LOG_FORMAT")
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "compact" => LogFormat::Compact,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Full,
        }
    }
}

/// Installs the global subscriber. `RUST_LOG` picks the filter (default
/// `info`), `PROJSYNC_LOG_FORMAT` the console format, and `PROJSYNC_LOG_DIR`
/// adds a daily rolling file. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter, LogFormat::from_env());
}

fn install(filter: EnvFilter, format: LogFormat) {
    let console = match format {
        LogFormat::Full => fmt::layer().boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
    };
    let registry = tracing_subscriber::registry().with(console.with_filter(filter));

    match std::env::var("PROJSYNC_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            if std::fs::create_dir_all(&dir).is_err() {
                tracing::warn!(directory = %dir, "failed to create log directory");
            }
            let writer = tracing_appender::rolling::daily(&dir, "projsync");
            let (nb, guard) = tracing_appender::non_blocking(writer);
            let _ = FILE_GUARD.set(guard);
            let file_filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
            let file_layer = fmt::layer()
                .with_ansi(false)
                .with_writer(nb)
                .with_filter(file_filter);
            let _ = registry.with(file_layer).try_init();
        }
        _ => {
            let _ = registry.try_init();
        }
    }
}

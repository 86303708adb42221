use std::{path::PathBuf, sync::OnceLock};

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn, Level};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{filter::LevelFilter, prelude::*, reload, EnvFilter, Registry};

struct Filter {
    handle: reload::Handle<EnvFilter, Registry>,

    /// The base directive first, then per-target directives in the order they were set.
    directives: Mutex<Vec<String>>,
}

static FILTER: OnceLock<Filter> = OnceLock::new();

fn do_init(stdout_level: Level, file_level: Option<(Level, PathBuf)>) {
    let mut message = String::from("Logging with: stdout");

    let base = std::env::var("RUST_LOG").unwrap_or_else(|_| stdout_level.to_string());

    let (filter_layer, handle) = reload::Layer::new(EnvFilter::new(&base));

    let registry = tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer());

    let maybe_file_layer = if let Some((level, output_dir)) = file_level {
        message += &format!(", file (in dir {output_dir:?})");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, output_dir, "gateway.log");

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_filter(LevelFilter::from(level));
        Some(file_layer)
    } else {
        None
    };

    registry.with(maybe_file_layer).init();

    // Only the first initialization gets here.
    let _ = FILTER.set(Filter {
        handle,
        directives: Mutex::new(vec![base]),
    });

    debug!(message);
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init(stdout_level: Level, file_logging: Option<(Level, PathBuf)>) {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init(stdout_level, file_logging);

        *initialized = true;
    }

    info!("Logging initialized");
}

/// Let everything logged from within `target` (a module path) through at `level` and above.
///
/// Does nothing if logging was not initialized through [`init`].
pub fn set_target_level(target: &str, level: Level) {
    let Some(filter) = FILTER.get() else {
        trace!(%target, %level, "Logging not initialized, not changing level");
        return;
    };

    let mut directives = filter.directives.lock();

    // A later directive for the same target replaces the earlier.
    let prefix = format!("{target}=");
    directives.retain(|directive| !directive.starts_with(&prefix));
    directives.push(format!("{target}={level}"));

    match filter
        .handle
        .reload(EnvFilter::new(directives.join(",")))
    {
        Ok(()) => debug!(%target, %level, "Log level set"),
        Err(e) => warn!(?e, %target, "Could not set log level"),
    }
}

use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes console (stderr) and JSON file logging.
///
/// The returned guard must stay alive for the life of the process, otherwise
/// buffered file log lines are lost on exit. `None` means the log dir could
/// not be created and only the console layer is active.
pub fn init_logging(log_dir: &Path) -> Option<WorkerGuard> {
    let default_directive: Directive = "music_etl=info"
        .parse()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let filter = EnvFilter::from_default_env().add_directive(default_directive);

    let (file_layer, guard, dir_error) = match fs::create_dir_all(log_dir) {
        Ok(()) => {
            // Daily rotation, written off the hot path.
            let file_appender = tracing_appender::rolling::daily(log_dir, "music_etl.log");
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer().json().with_writer(non_blocking_writer);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    // A subscriber installed earlier (tests, embedding binaries) wins.
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok();

    if let Some(e) = dir_error {
        tracing::warn!("could not create log dir {}: {}", log_dir.display(), e);
    }
    if !installed {
        tracing::debug!("global subscriber already set; keeping it");
    }
    guard
}

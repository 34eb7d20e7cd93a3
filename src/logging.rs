use std::ffi::OsStr;
use std::path::Path;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

// The returned guards flush the file writer when dropped, keep them alive in main
pub fn init(level: Level, console: bool, log_file: Option<&Path>) -> Vec<WorkerGuard> {
    let mut guards = Vec::new();

    let console_layer = console.then(|| {
        fmt::layer()
            .with_level(true) // include levels in formatted output
            .with_target(true) // include targets
            .with_thread_ids(false) // don't include the thread ID of the current thread
            .with_thread_names(false) // don't include the name of the current thread
            .compact() // use the `Compact` formatting style.
    });

    let file_layer = log_file.map(|path| {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path.file_name().unwrap_or_else(|| OsStr::new("inkdash.log"));
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .compact()
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(LevelFilter::from_level(level))
        .with(console_layer)
        .with(file_layer)
        .init();
    guards
}

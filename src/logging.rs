//! Logging Setup
//!
//! Structured logging per the `[logging]` configuration section: level,
//! `json` or `text` output, optional file target with time-based rotation.
//! `--debug <logger-name>` on either binary raises one module's level to
//! debug without touching the rest.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSection;

/// Initialize the global subscriber. Returns the appender guard that must
/// stay alive for the process lifetime when logging to a file.
pub fn init(section: &LoggingSection, debug_targets: &[String]) -> Option<WorkerGuard> {
    let mut filter = EnvFilter::new(section.level.clone());
    for target in debug_targets {
        if let Ok(directive) = format!("{}=debug", target).parse() {
            filter = filter.add_directive(directive);
        }
    }

    let (writer, guard) = match &section.file {
        Some(path) => {
            let path = std::path::Path::new(path);
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "bacmon.log".to_string());

            let appender = match section.rotation.as_str() {
                "hourly" => tracing_appender::rolling::hourly(directory, filename),
                "never" => tracing_appender::rolling::never(directory, filename),
                _ => tracing_appender::rolling::daily(directory, filename),
            };
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (writer, Some(guard))
        }
        None => {
            let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
            (writer, Some(guard))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    if section.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }

    guard
}

//! Logging setup for the training binary

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::FmtSubscriber;

/// Parse a verbosity name, defaulting to INFO
pub fn parse_level(verbosity: &str) -> Level {
    match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber
///
/// Events go to stdout and, when `log_file` is given, are appended to that
/// file as well. ANSI colouring is disabled when a file is attached.
pub fn init_logging(verbosity: &str, log_file: Option<&Path>) -> anyhow::Result<()> {
    let level = parse_level(verbosity);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Mutex::new(file)))
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    Ok(())
}

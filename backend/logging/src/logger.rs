//! Structured Logger
//!
//! Console output on stderr (stdout is left to command output), plus an
//! optional daily NDJSON file. `RUST_LOG` overrides the configured level.

use std::path::Path;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "callhub.log";

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn install(level: &str, file: Option<RollingFileAppender>) {
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let file = file.map(|appender| fmt::layer().json().with_writer(appender).with_ansi(false));

    // A second init (tests, embedding apps) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(level_filter(level))
        .with(console)
        .with(file)
        .try_init();
}

/// Console-only logging.
pub fn init_logger(level: &str) {
    install(level, None);
}

/// Console logging plus `<log_dir>/callhub.log.YYYY-MM-DD`.
pub fn init_file_logger<P: AsRef<Path>>(log_dir: P, level: &str) {
    let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
    install(level, Some(appender));
}

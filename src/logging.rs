//! Process-wide tracing subscriber.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

/// Name of the log file or FIFO the engine places in the bundle.
pub const LOG_FILE: &str = "log";

/// Filter from RUST_LOG, else `info` (`debug` when `debug` is set).
pub fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default))
}

/// Writer for the serving process: the bundle log when present, else stderr.
///
/// The log is opened read-write so opening a FIFO with no reader yet does not
/// block.
pub fn bundle_writer(bundle: &Path) -> BoxMakeWriter {
    let path = bundle.join(LOG_FILE);
    if !path.exists() {
        return BoxMakeWriter::new(std::io::stderr);
    }
    match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => BoxMakeWriter::new(Mutex::new(file)),
        Err(e) => {
            eprintln!("failed to open {}: {e}, logging to stderr", path.display());
            BoxMakeWriter::new(std::io::stderr)
        }
    }
}

/// Installs the global subscriber. A subscriber installed earlier wins.
pub fn init(debug: bool, writer: BoxMakeWriter) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(debug))
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer)
        .try_init()
        .ok();
}

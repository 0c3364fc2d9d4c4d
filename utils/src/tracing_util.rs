//! Helpers related to tracing, used by main entrypoints

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

static LOG_FILE: OnceLock<Mutex<Option<File>>> = OnceLock::new();

fn log_file_slot() -> &'static Mutex<Option<File>> {
    LOG_FILE.get_or_init(|| Mutex::new(None))
}

/// Writer for the per-run log file; output is discarded until
/// [`attach_log_file`] has been called.
#[derive(Debug)]
struct LogFileWriter;

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match log_file_slot().lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(f) => f.write(buf),
                None => Ok(buf.len()),
            },
            // A panic while holding the lock; drop the line rather than propagate
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match log_file_slot().lock() {
            Ok(mut guard) => guard.as_mut().map_or(Ok(()), |f| f.flush()),
            Err(_) => Ok(()),
        }
    }
}

/// Initialize tracing with the default configuration.
///
/// Human-oriented output goes to stderr, filtered by `RUST_LOG` (default `info`).
/// A second, timestamped layer at debug level writes to the log file once one
/// is attached.
pub fn initialize_tracing() {
    // Don't include timestamps and such on the console because they're not
    // really useful and too verbose; the log file carries them.
    let console = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );
    let file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(|| LogFileWriter)
        .with_filter(LevelFilter::DEBUG);
    tracing_subscriber::registry().with(console).with(file).init();
}

/// Direct the file layer at `path`. With `append` the existing content is
/// kept, otherwise the file is truncated.
pub fn attach_log_file(path: &Path, append: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let f = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let mut guard = log_file_slot()
        .lock()
        .map_err(|_| anyhow::anyhow!("log file lock poisoned"))?;
    *guard = Some(f);
    Ok(())
}

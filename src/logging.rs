//! Log sink selection: stderr via `simple_logger` by default, or append
//! to a file when `-log=PATH` is given. `simple_logger` has no file
//! backend of its own, so the file path gets a small dedicated `Log`
//! implementation instead.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::config::LogLevel;

struct FileLogger {
    level: Level,
    file: Mutex<std::fs::File>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{now} {:<5} [{}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Initializes the global logger per `-log`/`-log-level`. A file that
/// can't be opened falls back to stderr rather than aborting startup
/// over a logging misconfiguration.
pub fn init(level: LogLevel, log_path: Option<&Path>) -> anyhow::Result<()> {
    let level_filter = match level {
        LogLevel::Error => LevelFilter::Error,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Trace => LevelFilter::Trace,
    };

    let Some(path) = log_path else {
        return Ok(simple_logger::init_with_level(level.as_level())?);
    };

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => {
            let logger = FileLogger { level: level.as_level(), file: Mutex::new(file) };
            log::set_boxed_logger(Box::new(logger))?;
            log::set_max_level(level_filter);
            Ok(())
        }
        Err(e) => {
            eprintln!("could not open log file {path:?} ({e}), logging to stderr instead");
            Ok(simple_logger::init_with_level(level.as_level())?)
        }
    }
}

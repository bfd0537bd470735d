//! Console and rotating file logging
//!
//! The console side is an `env_logger` logger driven by `--log-level` (or
//! `RTC_NATIVE_LOG`). The file side always records `Info` and above into a
//! size-capped set of files, `<prefix>_0` being the current one.

use crate::config::LoggingConfig;
use crate::error::AppError;
use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable that overrides the console filter
pub const LOG_ENV: &str = "RTC_NATIVE_LOG";

/// Level the file sink records regardless of the console level
const FILE_LEVEL: LevelFilter = LevelFilter::Info;

/// Crates whose chatter is capped at `Error` on both sinks
const NOISY_MODULES: [&str; 3] = ["webrtc_ice", "webrtc_dtls", "webrtc_mdns"];

/// Map the `--log-level` severity (0 sensitive .. 5 none) to a filter
pub fn level_from_severity(severity: u8) -> LevelFilter {
    match severity {
        0 => LevelFilter::Trace,
        1 => LevelFilter::Debug,
        2 => LevelFilter::Info,
        3 => LevelFilter::Warn,
        4 => LevelFilter::Error,
        _ => LevelFilter::Off,
    }
}

/// Size-capped file set: `<prefix>_0` .. `<prefix>_<max_files - 1>`
pub struct RotatingFile {
    dir: PathBuf,
    prefix: String,
    max_size: u64,
    max_files: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    /// Open the current file, rotating a non-empty leftover out of the way
    pub fn open(cfg: &LoggingConfig) -> io::Result<Self> {
        fs::create_dir_all(&cfg.dir)?;

        let current = file_path(&cfg.dir, &cfg.file_prefix, 0);
        let leftover = fs::metadata(&current).map(|m| m.len() > 0).unwrap_or(false);
        if leftover {
            shift_files(&cfg.dir, &cfg.file_prefix, cfg.max_files)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&current)?;

        Ok(Self {
            dir: cfg.dir.clone(),
            prefix: cfg.file_prefix.clone(),
            max_size: cfg.max_file_size,
            max_files: cfg.max_files,
            file,
            written: 0,
        })
    }

    pub fn current_path(&self) -> PathBuf {
        file_path(&self.dir, &self.prefix, 0)
    }

    /// Append one line, rotating first if it would overflow the cap
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        let len = line.len() as u64 + 1;
        if self.written > 0 && self.written + len > self.max_size {
            self.rotate()?;
        }
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.written += len;
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        shift_files(&self.dir, &self.prefix, self.max_files)?;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.current_path())?;
        self.written = 0;
        Ok(())
    }
}

fn file_path(dir: &Path, prefix: &str, index: usize) -> PathBuf {
    dir.join(format!("{}_{}", prefix, index))
}

/// Drop the oldest file and move every `_i` to `_i+1`
fn shift_files(dir: &Path, prefix: &str, max_files: usize) -> io::Result<()> {
    if max_files <= 1 {
        return match fs::remove_file(file_path(dir, prefix, 0)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        };
    }

    let oldest = file_path(dir, prefix, max_files - 1);
    if let Err(e) = fs::remove_file(&oldest) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(e);
        }
    }

    for index in (0..max_files - 1).rev() {
        let from = file_path(dir, prefix, index);
        if from.exists() {
            fs::rename(&from, file_path(dir, prefix, index + 1))?;
        }
    }
    Ok(())
}

fn is_noisy(target: &str) -> bool {
    NOISY_MODULES
        .iter()
        .any(|m| target == *m || target.starts_with(&format!("{}::", m)))
}

/// Fan-out logger: console via env_logger, file via `RotatingFile`
struct CompositeLogger {
    console: env_logger::Logger,
    file: Arc<Mutex<RotatingFile>>,
}

impl CompositeLogger {
    fn file_accepts(&self, metadata: &Metadata) -> bool {
        if is_noisy(metadata.target()) {
            return metadata.level() <= log::Level::Error;
        }
        metadata.level() <= FILE_LEVEL
    }
}

impl Log for CompositeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.console.enabled(metadata) || self.file_accepts(metadata)
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }

        if self.file_accepts(record.metadata()) {
            let line = format!(
                "[{} {:<5} {}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            );
            // Nowhere to report a failing log sink; drop the line.
            let _ = self.file.lock().write_line(&line);
        }
    }

    fn flush(&self) {
        self.console.flush();
        let _ = self.file.lock().flush();
    }
}

/// Owns the process logging sinks from startup until after teardown
pub struct LogContext {
    file: Arc<Mutex<RotatingFile>>,
    console_level: LevelFilter,
}

impl LogContext {
    /// Open the file sink and install the global logger
    pub fn init(cfg: &LoggingConfig, severity: u8) -> Result<Self, AppError> {
        let (logger, context) = Self::build(cfg, level_from_severity(severity))?;
        let max_level = std::cmp::max(logger.console.filter(), FILE_LEVEL);
        log::set_boxed_logger(Box::new(logger))?;
        log::set_max_level(max_level);
        Ok(context)
    }

    fn build(cfg: &LoggingConfig, level: LevelFilter) -> Result<(CompositeLogger, Self), AppError> {
        let file = RotatingFile::open(cfg).map_err(|source| AppError::LogSink {
            dir: cfg.dir.clone(),
            source,
        })?;
        let file = Arc::new(Mutex::new(file));

        let mut builder = env_logger::Builder::new();
        builder.filter_level(level);
        if let Ok(filters) = std::env::var(LOG_ENV) {
            builder.parse_filters(&filters);
        }
        for module in NOISY_MODULES {
            builder.filter_module(module, LevelFilter::Error);
        }
        let console = builder.build();
        let console_level = console.filter();

        let logger = CompositeLogger {
            console,
            file: file.clone(),
        };
        Ok((logger, Self { file, console_level }))
    }

    pub fn console_level(&self) -> LevelFilter {
        self.console_level
    }

    pub fn file_path(&self) -> PathBuf {
        self.file.lock().current_path()
    }

    pub fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

impl Drop for LogContext {
    fn drop(&mut self) {
        self.flush();
    }
}

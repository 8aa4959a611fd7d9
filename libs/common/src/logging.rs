//! Unified logging module for EdgeLink services
//!
//! Console output plus a daily rolling file (`{YYYYMMDD}_{service}.log`), with a
//! reloadable `EnvFilter` so the level can be changed without a restart.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    reload,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Custom event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2026-01-01T00:50:44.809000Z [INFO] Proto p1 started`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

// Keeps the non-blocking writer flushing for the process lifetime
static GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();

type EnvFilterReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;
static LOG_FILTER_HANDLE: OnceLock<EnvFilterReloadHandle> = OnceLock::new();
static CURRENT_LOG_LEVEL: OnceLock<Mutex<String>> = OnceLock::new();

/// Log file name for a given day: `{YYYYMMDD}_{service}.log`
pub fn log_file_name(date: &str, service_name: &str) -> String {
    format!("{}_{}.log", date, service_name)
}

fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

fn lock_err<T>(e: std::sync::PoisonError<T>) -> std::io::Error {
    std::io::Error::other(format!("Mutex poisoned: {}", e))
}

/// Daily rolling file writer; switches file at local midnight or when the
/// current file has been removed from under it.
#[derive(Clone)]
struct DailyRollingWriter {
    service_name: String,
    log_dir: PathBuf,
    state: Arc<Mutex<(String, File)>>,
}

impl DailyRollingWriter {
    fn new(service_name: String, log_dir: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&log_dir)?;
        let date = today();
        let file = Self::open(&log_dir, &date, &service_name)?;
        Ok(Self {
            service_name,
            log_dir,
            state: Arc::new(Mutex::new((date, file))),
        })
    }

    fn open(log_dir: &std::path::Path, date: &str, service_name: &str) -> std::io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_dir.join(log_file_name(date, service_name)))
    }
}

impl std::io::Write for DailyRollingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut state = self.state.lock().map_err(lock_err)?;
        let date = today();
        let path = self.log_dir.join(log_file_name(&state.0, &self.service_name));
        if state.0 != date || !path.exists() {
            fs::create_dir_all(&self.log_dir)?;
            let file = Self::open(&self.log_dir, &date, &self.service_name)?;
            *state = (date, file);
        }
        std::io::Write::write(&mut state.1, buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut state = self.state.lock().map_err(lock_err)?;
        std::io::Write::flush(&mut state.1)
    }
}

/// Logger configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Service name, used in the file name and the default filter
    pub service_name: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Filter directive used when `RUST_LOG` is not set (e.g. "info")
    pub level: String,
    /// JSON lines in the log file instead of the bracketed format
    pub enable_json: bool,
    /// ANSI colors on the console
    pub ansi: bool,
    /// Write a log file at all
    pub enable_file: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".to_string(),
            log_dir: PathBuf::from("logs"),
            level: "info".to_string(),
            enable_json: false,
            ansi: true,
            enable_file: true,
        }
    }
}

/// Initialize logging system with configuration
pub fn init_with_config(config: LogConfig) -> Result<(), Box<dyn std::error::Error>> {
    // RUST_LOG wins; otherwise the configured level with the service at debug
    let filter_str = match std::env::var("RUST_LOG") {
        Ok(env_str) if !env_str.trim().is_empty() => env_str,
        _ => format!("{},{}=debug", config.level, config.service_name),
    };
    let env_filter = EnvFilter::try_new(&filter_str)?;

    let (reload_filter, reload_handle) = reload::Layer::new(env_filter);
    let _ = LOG_FILTER_HANDLE.set(reload_handle);
    let _ = CURRENT_LOG_LEVEL.set(Mutex::new(filter_str));

    let console_layer = fmt::layer()
        .with_ansi(config.ansi)
        .event_format(BracketedLevelFormat)
        .boxed();

    let file_layer = if config.enable_file {
        let writer = DailyRollingWriter::new(config.service_name.clone(), config.log_dir.clone())?;
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);

        let guards = GUARDS.get_or_init(|| Mutex::new(Vec::new()));
        match guards.lock() {
            Ok(mut guards) => guards.push(guard),
            Err(poisoned) => poisoned.into_inner().push(guard),
        }

        let layer = if config.enable_json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_level(true)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        Some(layer)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(reload_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if config.enable_file {
        tracing::info!(
            "Logging: {} @ {:?}",
            log_file_name(&today(), &config.service_name),
            config.log_dir
        );
    }

    Ok(())
}

/// Dynamically set log filter level at runtime
///
/// Accepts a bare level ("debug") or a full filter spec ("info,collectsrv=debug").
pub fn set_log_level(level: &str) -> Result<(), String> {
    let handle = LOG_FILTER_HANDLE
        .get()
        .ok_or("Logging not initialized with reload support")?;

    let new_filter =
        EnvFilter::try_new(level).map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

    handle
        .reload(new_filter)
        .map_err(|e| format!("Failed to reload log filter: {}", e))?;

    if let Some(current) = CURRENT_LOG_LEVEL.get() {
        if let Ok(mut guard) = current.lock() {
            *guard = level.to_string();
        }
    }

    tracing::info!("Log level changed to: {}", level);
    Ok(())
}

/// Get current log filter level
pub fn get_log_level() -> String {
    CURRENT_LOG_LEVEL
        .get()
        .and_then(|m| m.lock().ok())
        .map(|guard| guard.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_file_name() {
        assert_eq!(log_file_name("20260101", "collectsrv"), "20260101_collectsrv.log");
    }

    #[test]
    fn test_rolling_writer_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            DailyRollingWriter::new("svc".to_string(), dir.path().to_path_buf()).unwrap();
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();

        let path = dir.path().join(log_file_name(&today(), "svc"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello\n");

        // Recreated after removal
        fs::remove_file(&path).unwrap();
        writer.write_all(b"again\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "again\n");
    }

    #[test]
    fn test_set_level_before_init_fails() {
        if LOG_FILTER_HANDLE.get().is_none() {
            assert!(set_log_level("debug").is_err());
        }
    }
}

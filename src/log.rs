//! Named loggers on top of `tracing`.
//!
//! A [`Logger`] is a named handle with its own minimum level. Messages that
//! pass the level check are forwarded as `tracing` events carrying the logger
//! name as a structured field, so any installed subscriber sees them.
//!
//! A logger may also own appenders, each a private fmt subscriber writing to
//! stdout or a file with its own level. A logger with appenders writes only
//! to them; one without falls back to the global subscriber.
//!
//! Every event carries the running fiber id and the crate-level thread name.
//!
//! Logger levels and appenders can be driven from configuration: the `logs`
//! key holds a list of [`LoggerDefine`] entries, and changing it updates the
//! named loggers.

use crate::config::{Config, ConfigVar};
use crate::context;
use crate::error::{Error, Result};
use crate::thread::Thread;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};
use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;

/// Config key holding the logger definitions.
pub const LOGS_CONFIG_KEY: &str = "logs";

/// Severity of a log message, lowest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Fatal,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "FATAL" => Ok(LogLevel::Fatal),
            _ => Err(Error::InvalidLogLevel(s.to_string())),
        }
    }
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Fatal => tracing::Level::ERROR,
        }
    }
}

/// Line layout used by an appender.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Timestamp, level, thread name, then the message and all fields.
    #[default]
    Full,
    /// Single-line abbreviated output.
    Compact,
}

/// One entry of a logger's `appenders` list.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AppenderDefine {
    #[serde(alias = "StdoutLogAppender")]
    Stdout {
        #[serde(default)]
        level: LogLevel,
        /// Overrides the logger's format when set.
        #[serde(default)]
        formatter: Option<LogFormat>,
    },
    #[serde(alias = "FileLogAppender")]
    File {
        file: PathBuf,
        #[serde(default)]
        level: LogLevel,
        #[serde(default)]
        formatter: Option<LogFormat>,
    },
}

impl AppenderDefine {
    pub fn level(&self) -> LogLevel {
        match self {
            AppenderDefine::Stdout { level, .. } | AppenderDefine::File { level, .. } => *level,
        }
    }

    fn formatter(&self) -> Option<LogFormat> {
        match self {
            AppenderDefine::Stdout { formatter, .. } | AppenderDefine::File { formatter, .. } => {
                *formatter
            }
        }
    }
}

#[derive(Debug)]
struct Appender {
    level: LogLevel,
    dispatch: Dispatch,
}

impl Appender {
    fn build(define: &AppenderDefine, fallback: LogFormat) -> Result<Appender> {
        let format = define.formatter().unwrap_or(fallback);
        let dispatch = match define {
            AppenderDefine::Stdout { .. } => appender_dispatch(std::io::stdout, format, true),
            AppenderDefine::File { file, .. } => {
                let handle = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(file)
                    .map_err(|source| Error::LogAppender {
                        path: file.clone(),
                        source,
                    })?;
                appender_dispatch(Arc::new(handle), format, false)
            }
        };
        Ok(Appender {
            level: define.level(),
            dispatch,
        })
    }
}

fn appender_dispatch<W>(writer: W, format: LogFormat, ansi: bool) -> Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(ansi)
        .with_target(false)
        .with_thread_names(true);
    match format {
        LogFormat::Full => Dispatch::new(builder.finish()),
        LogFormat::Compact => Dispatch::new(builder.compact().finish()),
    }
}

fn forward(level: LogLevel, logger: &str, fiber_id: u64, thread: &str, message: &dyn fmt::Display) {
    match level {
        LogLevel::Debug => tracing::debug!(logger, fiber_id, thread, "{}", message),
        LogLevel::Info => tracing::info!(logger, fiber_id, thread, "{}", message),
        LogLevel::Warn => tracing::warn!(logger, fiber_id, thread, "{}", message),
        LogLevel::Error => tracing::error!(logger, fiber_id, thread, "{}", message),
        LogLevel::Fatal => tracing::error!(logger, fiber_id, thread, fatal = true, "{}", message),
    }
}

/// A named logger with its own level threshold and appenders.
#[derive(Debug)]
pub struct Logger {
    name: String,
    level: AtomicU8,
    appenders: RwLock<Vec<Appender>>,
}

lazy_static::lazy_static! {
    static ref LOGGERS: Mutex<HashMap<String, Arc<Logger>>> = Mutex::new(HashMap::new());
    static ref SYSTEM_LOGGER: Arc<Logger> = Logger::named("system");
}

impl Logger {
    fn new(name: &str) -> Self {
        Logger {
            name: name.to_string(),
            level: AtomicU8::new(LogLevel::Debug as u8),
            appenders: RwLock::new(Vec::new()),
        }
    }

    /// Returns the logger registered under `name`, creating it on first use.
    pub fn named(name: &str) -> Arc<Logger> {
        let mut loggers = LOGGERS.lock();
        loggers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Logger::new(name)))
            .clone()
    }

    pub fn root() -> Arc<Logger> {
        Logger::named("root")
    }

    /// The logger the runtime reports faults through.
    pub fn system() -> Arc<Logger> {
        SYSTEM_LOGGER.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level()
    }

    /// Opens the sink described by `define` and adds it to this logger.
    pub fn add_appender(&self, define: &AppenderDefine) -> Result<()> {
        let appender = Appender::build(define, LogFormat::default())?;
        self.appenders.write().push(appender);
        Ok(())
    }

    /// Drops every appender; later messages go to the global subscriber.
    pub fn clear_appenders(&self) {
        self.appenders.write().clear();
    }

    pub fn appender_count(&self) -> usize {
        self.appenders.read().len()
    }

    fn replace_appenders(&self, appenders: Vec<Appender>) {
        *self.appenders.write() = appenders;
    }

    /// Emits `message` at `level` if this logger lets it through.
    pub fn emit(&self, level: LogLevel, message: impl fmt::Display) {
        if !self.enabled(level) {
            return;
        }
        let fiber_id = context::current_fiber_id();
        let thread = Thread::current_name();
        let appenders = self.appenders.read();
        if appenders.is_empty() {
            forward(level, &self.name, fiber_id, &thread, &message);
            return;
        }
        for appender in appenders.iter().filter(|appender| level >= appender.level) {
            tracing::dispatcher::with_default(&appender.dispatch, || {
                forward(level, &self.name, fiber_id, &thread, &message)
            });
        }
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Error, message);
    }

    pub fn fatal(&self, message: impl fmt::Display) {
        self.emit(LogLevel::Fatal, message);
    }
}

/// One entry of the `logs` config value.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoggerDefine {
    pub name: String,
    #[serde(default)]
    pub level: LogLevel,
    /// Format for appenders that do not pick their own.
    #[serde(default)]
    pub formatter: LogFormat,
    #[serde(default)]
    pub appenders: Vec<AppenderDefine>,
}

static REGISTER_LOGS: Once = Once::new();

/// Registers the `logs` config value and the listener that applies it.
///
/// Called before YAML ingestion so a `logs:` section always has a target.
pub fn register_logger_config() {
    REGISTER_LOGS.call_once(|| {
        match Config::lookup::<Vec<LoggerDefine>>(LOGS_CONFIG_KEY, Vec::new(), "logger definitions") {
            Ok(var) => {
                var.add_listener(apply_logger_defines);
            }
            Err(err) => Logger::root().error(format_args!("cannot register `logs`: {err}")),
        }
    });
}

/// Returns the `logs` config value, registering it if needed.
pub fn logger_config() -> Option<Arc<ConfigVar<Vec<LoggerDefine>>>> {
    register_logger_config();
    Config::get(LOGS_CONFIG_KEY)
}

fn apply_logger_defines(old: &Vec<LoggerDefine>, new: &Vec<LoggerDefine>) {
    let kept: BTreeSet<&str> = new.iter().map(|define| define.name.as_str()).collect();
    for define in new {
        let logger = Logger::named(&define.name);
        logger.set_level(define.level);
        // Unchanged entries keep their open sinks.
        if old.contains(define) {
            continue;
        }
        let mut appenders = Vec::with_capacity(define.appenders.len());
        for appender in &define.appenders {
            match Appender::build(appender, define.formatter) {
                Ok(appender) => appenders.push(appender),
                Err(err) => Logger::system().error(format_args!(
                    "logger `{}` skipped an appender: {err}",
                    define.name
                )),
            }
        }
        logger.replace_appenders(appenders);
    }
    for define in old {
        if !kept.contains(define.name.as_str()) {
            let logger = Logger::named(&define.name);
            logger.set_level(LogLevel::Debug);
            logger.clear_appenders();
        }
    }
}

static INIT_LOGGING: Once = Once::new();

/// Installs a global fmt subscriber at `level`. The first call wins.
pub fn init_logging(level: LogLevel) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::from(level))
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .try_init();
    });
}

/// Like [`init_logging`] but writes through the test harness's capture.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_ansi(false)
            .try_init();
    });
}

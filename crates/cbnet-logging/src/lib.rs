use std::fmt::{self, Write as _};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_appender::rolling;
use tracing_subscriber::layer::Context;
use tracing_subscriber::{fmt as tfmt, prelude::*, EnvFilter, Layer};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Severity scale exposed to applications.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    /// Map a tracing level onto this scale. `TRACE` folds into `Debug`.
    pub fn from_tracing(level: &Level) -> Self {
        match *level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(LoggingError::UnknownLevel(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("unknown log level: {0}")]
    UnknownLevel(String),
    #[error("failed to create rolling file appender: {0}")]
    Appender(String),
    #[error("a global subscriber is already installed")]
    AlreadyInitialized,
}

/// Application log sink: receives every forwarded record.
pub type LogHandler = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;

/// Runtime log level plus the optional application sink.
pub struct LogControl {
    level: AtomicU8,
    handler: Option<LogHandler>,
}

impl LogControl {
    pub fn new(level: LogLevel, handler: Option<LogHandler>) -> Self {
        Self {
            level: AtomicU8::new(level.into()),
            handler,
        }
    }

    pub fn level(&self) -> LogLevel {
        LogLevel::try_from(self.level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level.into(), Ordering::Relaxed);
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.level()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Deliver `message` to the sink if `level` passes the current filter.
    pub fn emit(&self, level: LogLevel, message: &str) {
        if let Some(handler) = &self.handler {
            if self.enabled(level) {
                handler(level, message);
            }
        }
    }
}

impl fmt::Debug for LogControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogControl")
            .field("level", &self.level())
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
enum SinkSource {
    Fixed(Arc<LogControl>),
    Global,
}

/// Layer forwarding formatted events to a `LogControl` sink.
#[derive(Debug, Clone)]
pub struct SinkLayer {
    source: SinkSource,
}

impl SinkLayer {
    pub fn new(control: Arc<LogControl>) -> Self {
        Self {
            source: SinkSource::Fixed(control),
        }
    }

    /// A layer forwarding to whichever control is currently published with
    /// [`install_sink`]. Forwards nothing while the slot is empty.
    pub fn global() -> Self {
        Self {
            source: SinkSource::Global,
        }
    }

    fn forward(&self, event: &Event<'_>) {
        match &self.source {
            SinkSource::Fixed(control) => forward_event(control, event),
            SinkSource::Global => {
                let current = global_slot().load();
                if let Some(control) = &*current {
                    forward_event(control, event);
                }
            }
        }
    }
}

fn forward_event(control: &LogControl, event: &Event<'_>) {
    if !control.has_handler() {
        return;
    }
    let level = LogLevel::from_tracing(event.metadata().level());
    if !control.enabled(level) {
        return;
    }
    let mut visitor = MessageVisitor::default();
    event.record(&mut visitor);
    visitor.message.push_str(&visitor.fields);
    control.emit(level, &visitor.message);
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.forward(event);
    }
}

/// Set once a global subscriber carrying `SinkLayer::global()` is installed.
static GLOBAL_LAYER: AtomicBool = AtomicBool::new(false);

fn global_slot() -> &'static ArcSwapOption<LogControl> {
    static SLOT: OnceLock<ArcSwapOption<LogControl>> = OnceLock::new();
    SLOT.get_or_init(ArcSwapOption::empty)
}

/// Publish `control` as the target of the global sink layer, installing a
/// sink-only global subscriber if no `init_logging` subscriber exists.
///
/// Replaces any previously published control. Fails with
/// `AlreadyInitialized` when the host owns a global subscriber without the
/// sink layer; nothing is published in that case.
pub fn install_sink(control: Arc<LogControl>) -> Result<(), LoggingError> {
    if !GLOBAL_LAYER.load(Ordering::Acquire) {
        let installed = tracing_subscriber::registry()
            .with(SinkLayer::global())
            .try_init()
            .is_ok();
        if installed {
            GLOBAL_LAYER.store(true, Ordering::Release);
        } else if !GLOBAL_LAYER.load(Ordering::Acquire) {
            return Err(LoggingError::AlreadyInitialized);
        }
    }
    global_slot().store(Some(control));
    Ok(())
}

/// Empty the global sink slot if it still holds `control`. Returns whether
/// it did.
pub fn uninstall_sink(control: &Arc<LogControl>) -> bool {
    let mut cleared = false;
    global_slot().rcu(|current| match current {
        Some(c) if Arc::ptr_eq(c, control) => {
            cleared = true;
            None
        }
        other => {
            cleared = false;
            other.clone()
        }
    });
    cleared
}

/// Whether `control` is the currently published sink.
pub fn is_sink_installed(control: &Arc<LogControl>) -> bool {
    let current = global_slot().load();
    matches!(&*current, Some(c) if Arc::ptr_eq(c, control))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. If None, no file logging.
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    /// Log rotation: "hourly", "daily", "never".
    #[serde(default = "default_rotation")]
    pub rotation: String,

    #[serde(default)]
    pub json_format: bool,

    #[serde(default = "default_true")]
    pub console_output: bool,
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "cbnet".into()
}

fn default_rotation() -> String {
    "daily".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: default_rotation(),
            json_format: false,
            console_output: true,
        }
    }
}

/// Initialize process logging. Returns the guard of the non-blocking file
/// writer; it must stay alive for the duration of the program.
///
/// The subscriber also carries `SinkLayer::global()`, so a sink published
/// later with [`install_sink`] receives records too.
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<Box<dyn Layer<_> + Send + Sync>> = if config.console_output {
        if config.json_format {
            Some(Box::new(tfmt::layer().json()))
        } else {
            Some(Box::new(tfmt::layer()))
        }
    } else {
        None
    };

    let (file_layer, guard): (
        Option<Box<dyn Layer<_> + Send + Sync>>,
        Option<tracing_appender::non_blocking::WorkerGuard>,
    ) = if let Some(ref log_dir) = config.log_dir {
        let rotation = match config.rotation.as_str() {
            "hourly" => rolling::Rotation::HOURLY,
            "never" => rolling::Rotation::NEVER,
            _ => rolling::Rotation::DAILY,
        };

        let file_appender = rolling::RollingFileAppender::builder()
            .rotation(rotation)
            .filename_prefix(&config.file_prefix)
            .filename_suffix("log")
            .build(log_dir)
            .map_err(|e| LoggingError::Appender(e.to_string()))?;

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let layer: Box<dyn Layer<_> + Send + Sync> = if config.json_format {
            Box::new(tfmt::layer().json().with_writer(non_blocking))
        } else {
            Box::new(tfmt::layer().with_writer(non_blocking))
        };

        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    registry
        .with(console_layer)
        .with(file_layer)
        .with(SinkLayer::global())
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)?;
    GLOBAL_LAYER.store(true, Ordering::Release);

    Ok(guard)
}

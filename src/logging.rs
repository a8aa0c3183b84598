//! Logging setup
//!
//! [`init_tracing`] installs the process-wide subscriber from settings.
//! [`run_with_logging_scope`] captures the logs of one build invocation
//! without touching the global subscriber.

use crate::config::LoggingSettings;
use crate::error::{CacheError, CacheResult};
use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::instrument::WithSubscriber;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Verbosity of a logging scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(Self::Error),
            "warn" | "warning" => Ok(Self::Warn),
            "info" => Ok(Self::Info),
            "debug" => Ok(Self::Debug),
            "trace" => Ok(Self::Trace),
            other => Err(CacheError::ConfigInvalid {
                path: "logging.level".into(),
                reason: format!("unknown log level '{}'", other),
            }),
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// In-memory log sink shared by clones
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub fn contents(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn clear(&self) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Writer handed out by [`CapturedOutput`]
pub struct CapturedWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CapturedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedOutput {
    type Writer = CapturedWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CapturedWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

/// Run `action` with its logs captured into `output` at `level`
///
/// The subscriber is only active while `action` is being polled. Whatever
/// was installed before is back in effect once `action` returns, fails or
/// panics. Tasks spawned by `action` do not inherit the scope.
pub async fn run_with_logging_scope<F, Fut, T>(
    level: LogLevel,
    output: &CapturedOutput,
    action: F,
) -> T
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(output.clone())
        .with_ansi(false)
        .with_target(false)
        .without_time()
        .finish();

    action().with_subscriber(subscriber).await
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level.
pub fn init_tracing(settings: &LoggingSettings) -> CacheResult<()> {
    let level: LogLevel = settings.level.parse()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("workcache={}", level)));

    let installed = match settings.format.as_str() {
        "text" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .try_init(),
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init(),
        other => {
            return Err(CacheError::ConfigInvalid {
                path: "logging.format".into(),
                reason: format!("unknown log format '{}'", other),
            })
        }
    };

    installed.map_err(|e| CacheError::Internal(format!("installing log subscriber: {}", e)))
}

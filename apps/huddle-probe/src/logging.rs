use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let (filter, throttled) = env_filter(config.level.to_filter());
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_thread_names(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(level = config.level.as_str(), file = ?config.file, "logging initialized");
    if throttled {
        eprintln!(
            "[huddle-log] webrtc internals held at info; set HUDDLE_TRACE_DEPS=1 or HUDDLE_LOG_FILTER to see them"
        );
    }
    Ok(())
}

fn env_filter(level: LevelFilter) -> (EnvFilter, bool) {
    if let Ok(filter) = std::env::var("HUDDLE_LOG_FILTER") {
        return (EnvFilter::new(filter), false);
    }
    let trace_deps = std::env::var("HUDDLE_TRACE_DEPS").is_ok_and(|v| v != "0" && !v.is_empty());
    let (filter, throttled) = default_directives(level, trace_deps);
    (EnvFilter::new(filter), throttled)
}

/// Crates that flood the log at trace level during ICE and DTLS.
const NOISY_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "interceptor",
    "rtcp",
    "rtp",
];

fn default_directives(level: LevelFilter, trace_deps: bool) -> (String, bool) {
    let mut base = match level {
        LevelFilter::TRACE => "info,huddle_probe=trace,huddle_signaling=trace,signal_bus=trace",
        LevelFilter::DEBUG => "info,huddle_probe=debug,huddle_signaling=debug,signal_bus=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    }
    .to_owned();
    if level != LevelFilter::TRACE || trace_deps {
        return (base, false);
    }
    for target in NOISY_TARGETS {
        base.push(',');
        base.push_str(target);
        base.push_str("=info");
    }
    (base, true)
}

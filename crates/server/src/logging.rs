//! Structured logging to `<data dir>/logs/server.log`.
//!
//! `AGENTSCOPE_LOG_FILTER` (then `RUST_LOG`) picks the filter,
//! `AGENTSCOPE_LOG_FORMAT=pretty` switches from JSON lines to human output.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::paths;

const DEFAULT_FILTER: &str = "info";
const LOG_FILE: &str = "server.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Keeps the non-blocking writer flushing; drop it last.
pub struct LoggingHandle {
    pub run_id: String,
    pub guard: WorkerGuard,
}

fn filter_directive() -> String {
    std::env::var("AGENTSCOPE_LOG_FILTER")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| DEFAULT_FILTER.to_string())
}

fn run_id() -> String {
    std::env::var("AGENTSCOPE_RUN_ID").unwrap_or_else(|_| {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("pid-{}-{}", std::process::id(), millis)
    })
}

pub fn init_logging() -> anyhow::Result<LoggingHandle> {
    let log_dir = paths::log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let log_path: PathBuf = log_dir.join(LOG_FILE);

    let directive = filter_directive();
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = LogFormat::from_env_value(std::env::var("AGENTSCOPE_LOG_FORMAT").ok().as_deref());

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(&log_dir, LOG_FILE));

    let subscriber = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .pretty()
                    .with_target(true),
            )
            .try_init()?,
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .with_writer(writer)
                    .json()
                    .flatten_event(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_current_span(true),
            )
            .try_init()?,
    }

    let run_id = run_id();
    tracing::info!(
        component = "logging",
        event = "logging.initialized",
        run_id = %run_id,
        log_path = %log_path.display(),
        format = ?format,
        filter = %directive,
    );

    Ok(LoggingHandle { run_id, guard })
}

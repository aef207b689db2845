//! Subscriber setup for the routing core
//!
//! Lifecycle events (streams, tracks, attach) log at `info`/`debug`. The
//! packet path logs one `trace` event per packet, so those targets stay
//! capped at `debug` unless `packet_trace` is set or `RUST_LOG` says
//! otherwise.

use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Modules that log per packet
const PACKET_PATH_TARGETS: [&str; 3] = [
    "mediarelay_sfu::source_group",
    "mediarelay_sfu::transponder",
    "mediarelay_sfu::transport",
];

/// Install the global subscriber: JSON or pretty output, to stdout or
/// appended to `file_path`.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directives(level, config.packet_trace))?,
    };

    let to_file = config.file_path.is_some();
    let writer = match &config.file_path {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    // Nothing here opens spans, only events
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(!to_file)
        .with_span_events(FmtSpan::NONE)
        .with_target(true)
        .with_thread_names(true);

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.as_str() == "json" {
        registry
            .with(layer.json().flatten_event(true).with_current_span(false))
            .try_init()?;
    } else {
        registry.with(layer.compact().with_line_number(true)).try_init()?;
    }

    Ok(())
}

/// Filter directives for `level`, capping the packet path at `debug` when
/// `level` is `trace` and per-packet events were not asked for.
fn filter_directives(level: Level, packet_trace: bool) -> String {
    let mut directives = level.to_string().to_lowercase();
    if level == Level::TRACE && !packet_trace {
        for target in PACKET_PATH_TARGETS {
            directives.push_str(&format!(",{target}=debug"));
        }
    }
    directives
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

//! Logging setup
//!
//! Installs a `tracing-subscriber` registry writing to stderr, as text or JSON.
//! Format and filter are chosen at runtime (arguments, then `CRADLE_LOG_FORMAT`,
//! `CRADLE_LOG`, `RUST_LOG`), never through cargo features.

use anyhow::Result;
use std::{io, sync::Once};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize logging; later calls are no-ops
///
/// * `format` - `"json"` for one JSON object per event, anything else for text.
///   Falls back to `CRADLE_LOG_FORMAT` when `None`.
/// * `level` - filter directive (e.g. `"debug"`, `"cradle_core::sync=trace"`).
///   Falls back to `CRADLE_LOG`, then `RUST_LOG`, then `info`.
pub fn init(format: Option<&str>, level: Option<&str>) -> Result<()> {
    INIT.call_once(|| {
        let filter = create_env_filter(level);
        let env_format = std::env::var("CRADLE_LOG_FORMAT").ok();
        let effective_format = format.or(env_format.as_deref()).unwrap_or("text");
        let span_events = span_events_for_format(effective_format);

        match effective_format {
            "json" => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .json()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
            _ => {
                tracing_subscriber::registry()
                    .with(
                        fmt::layer()
                            .with_target(true)
                            .with_span_events(span_events)
                            .with_writer(io::stderr),
                    )
                    .with(filter)
                    .init();
            }
        }

        tracing::debug!("Logging initialized with format: {}", effective_format);
    });

    Ok(())
}

fn create_env_filter(level: Option<&str>) -> EnvFilter {
    let spec = level
        .map(str::to_string)
        .or_else(|| std::env::var("CRADLE_LOG").ok());
    match spec {
        Some(spec) => EnvFilter::try_new(&spec).unwrap_or_else(|_| {
            tracing::warn!("Invalid log filter '{}', using 'info'", spec);
            EnvFilter::new("info")
        }),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Span lifecycle events: `CRADLE_LOG_SPAN_EVENTS` wins, else close events for JSON only
fn span_events_for_format(format: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    if let Ok(raw) = std::env::var("CRADLE_LOG_SPAN_EVENTS") {
        return parse_span_events(&raw);
    }

    match format {
        "json" => FmtSpan::NEW | FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}

fn parse_span_events(raw: &str) -> fmt::format::FmtSpan {
    use fmt::format::FmtSpan;

    raw.split(&[',', '|'][..])
        .map(|t| t.trim().to_lowercase())
        .fold(FmtSpan::NONE, |acc, token| {
            acc | match token.as_str() {
                "new" => FmtSpan::NEW,
                "close" => FmtSpan::CLOSE,
                "enter" => FmtSpan::ENTER,
                "exit" => FmtSpan::EXIT,
                "active" => FmtSpan::ACTIVE,
                "full" => FmtSpan::FULL,
                _ => FmtSpan::NONE,
            }
        })
}

pub fn is_initialized() -> bool {
    INIT.is_completed()
}

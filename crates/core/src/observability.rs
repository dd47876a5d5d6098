//! Canonical tracing spans and structured field names
//!
//! Every lifecycle, sync, dependency, log and LSP workflow opens one of these
//! spans so log consumers can group events by application.

use std::time::Instant;
use tracing::{span, Span};

/// Canonical span names
pub mod spans {
    pub const APP_CREATE: &str = "app.create";
    pub const APP_START: &str = "app.start";
    pub const APP_STOP: &str = "app.stop";
    pub const APP_DELETE: &str = "app.delete";
    pub const SYNC_RECONCILE: &str = "sync.reconcile";
    pub const DEPS_INSTALL: &str = "deps.install";
    pub const LSP_ATTACH: &str = "lsp.attach";
    pub const LOGS_TAIL: &str = "logs.tail";
}

/// Common field names for structured logging
pub mod fields {
    pub const APP_ID: &str = "app_id";
    pub const CONTAINER_ID: &str = "container_id";
    pub const DURATION_MS: &str = "duration_ms";
}

/// Span for a lifecycle transition (`app.create`, `app.start`, ...)
pub fn lifecycle_span(name: &'static str, app_id: &str) -> Span {
    match name {
        spans::APP_CREATE => span!(
            target: "cradle_core::observability",
            tracing::Level::INFO,
            spans::APP_CREATE,
            duration_ms = tracing::field::Empty,
            container_id = tracing::field::Empty,
            app_id = %app_id
        ),
        spans::APP_START => span!(
            target: "cradle_core::observability",
            tracing::Level::INFO,
            spans::APP_START,
            duration_ms = tracing::field::Empty,
            container_id = tracing::field::Empty,
            app_id = %app_id
        ),
        spans::APP_STOP => span!(
            target: "cradle_core::observability",
            tracing::Level::INFO,
            spans::APP_STOP,
            duration_ms = tracing::field::Empty,
            container_id = tracing::field::Empty,
            app_id = %app_id
        ),
        _ => span!(
            target: "cradle_core::observability",
            tracing::Level::INFO,
            spans::APP_DELETE,
            duration_ms = tracing::field::Empty,
            container_id = tracing::field::Empty,
            app_id = %app_id
        ),
    }
}

/// Span for one reconciliation pass
pub fn sync_span(app_id: &str, direction: &str) -> Span {
    span!(
        target: "cradle_core::observability",
        tracing::Level::INFO,
        spans::SYNC_RECONCILE,
        duration_ms = tracing::field::Empty,
        app_id = %app_id,
        direction = %direction
    )
}

/// Span for a dependency install run
pub fn deps_span(app_id: &str, ecosystem: &str) -> Span {
    span!(
        target: "cradle_core::observability",
        tracing::Level::INFO,
        spans::DEPS_INSTALL,
        duration_ms = tracing::field::Empty,
        app_id = %app_id,
        ecosystem = %ecosystem
    )
}

/// Span wrapping one LSP relay session
pub fn lsp_span(app_id: &str, session_id: u64) -> Span {
    span!(
        target: "cradle_core::observability",
        tracing::Level::INFO,
        spans::LSP_ATTACH,
        app_id = %app_id,
        session_id = session_id
    )
}

/// Span wrapping a log tail task
pub fn logs_span(app_id: &str, container_id: &str) -> Span {
    span!(
        target: "cradle_core::observability",
        tracing::Level::INFO,
        spans::LOGS_TAIL,
        app_id = %app_id,
        container_id = %container_id
    )
}

/// Span that records `duration_ms` on completion
///
/// Holds the span without entering it, so it can live across `.await` points.
/// Async work that should nest under it is instrumented with [`TimedSpan::span`].
pub struct TimedSpan {
    span: Span,
    start_time: Instant,
}

impl TimedSpan {
    pub fn new(span: Span) -> Self {
        Self {
            span,
            start_time: Instant::now(),
        }
    }

    /// Record elapsed time; the span closes when its last handle drops
    pub fn complete(self) {
        let duration_ms = u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.span.record(fields::DURATION_MS, duration_ms);
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let _span = lifecycle_span(spans::APP_START, "app-1");
        let _span = sync_span("app-1", "reconcile");
        let _span = deps_span("app-1", "npm");
        let _span = lsp_span("app-1", 3);
        let _span = logs_span("app-1", "c-1");
    }

    #[test]
    fn test_timed_span_records_container() {
        let timed = TimedSpan::new(lifecycle_span(spans::APP_CREATE, "app-1"));
        timed.span().record(fields::CONTAINER_ID, "c-1");
        timed.complete();
    }
}

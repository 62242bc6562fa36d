/*!
 * Tracing
 * Subscriber setup and per-stage spans for a run
 */

use crate::core::errors::Stage;
use std::time::{Duration, Instant};
use tracing::{debug, info, span, warn, Level, Span};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Environment switch for JSON output
pub const TRACE_JSON_ENV: &str = "NESTED_MAPS_TRACE_JSON";

/// Stages slower than this are reported at `warn`
const SLOW_STAGE: Duration = Duration::from_millis(100);

fn json_requested() -> bool {
    std::env::var(TRACE_JSON_ENV)
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false)
}

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - NESTED_MAPS_TRACE_JSON: Enable JSON output (default: false)
///
/// Returns false if a global subscriber was already installed.
pub fn init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json_requested() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_span_events(FmtSpan::NONE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        debug!(json = json_requested(), "tracing initialized");
    }
    installed
}

/// Generate a unique id correlating every stage of one run
pub fn generate_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span covering one bootstrap stage
pub struct StageSpan {
    span: Span,
    start: Instant,
    stage: Stage,
}

impl StageSpan {
    pub fn new(stage: Stage, run_id: &str) -> Self {
        let span = span!(
            Level::INFO,
            "stage",
            run_id = %run_id,
            stage = %stage,
            duration_us = tracing::field::Empty,
            result = tracing::field::Empty,
            error = tracing::field::Empty,
        );

        Self {
            span,
            start: Instant::now(),
            stage,
        }
    }

    #[inline]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn record_result(&self, success: bool) {
        self.span.record("result", if success { "success" } else { "error" });
    }

    pub fn record_error(&self, error: &str) {
        self.span.record("error", error);
        self.span.record("result", "error");
    }

    /// Enter the span context
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StageSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let _entered = self.span.enter();
        self.span.record("duration_us", duration.as_micros() as u64);

        if duration > SLOW_STAGE {
            warn!(
                stage = %self.stage,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow stage"
            );
        } else {
            debug!(stage = %self.stage, duration_us = duration.as_micros() as u64, "stage completed");
        }
    }
}

/// Helper to open a stage span
#[inline]
pub fn span_stage(stage: Stage, run_id: &str) -> StageSpan {
    StageSpan::new(stage, run_id)
}

/// Log the end of a run at the level its outcome deserves
pub fn log_run_outcome(run_id: &str, failed: Option<Stage>) {
    match failed {
        None => info!(run_id = %run_id, "run completed"),
        Some(stage) => warn!(run_id = %run_id, %stage, "run aborted"),
    }
}

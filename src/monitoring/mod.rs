/*!
 * Monitoring
 * Handle accounting and structured tracing
 */

mod ledger;
mod tracer;

pub use ledger::{HandleLedger, LedgerSnapshot};
pub use tracer::{generate_run_id, init_tracing, log_run_outcome, span_stage, StageSpan, TRACE_JSON_ENV};

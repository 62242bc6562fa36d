/*!
 * Lifecycle
 * Process resource limits and the staged run
 */

mod bootstrap;
mod limits;

pub use bootstrap::{Bootstrap, RunFailure, RunReport, StageRecord};
pub use limits::{LimitManager, Limits, LimitsError};

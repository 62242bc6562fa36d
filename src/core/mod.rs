/*!
 * Core Module
 * Fundamental types, constants, handle guards and error handling
 */

pub mod errors;
pub mod guard;
pub mod limits;
pub mod types;

// Re-export for convenience
pub use errors::*;
pub use guard::{BorrowedMap, Guard, GuardError, GuardResult, HandleOrigin, MapAccess, MapHandle};
pub use types::*;

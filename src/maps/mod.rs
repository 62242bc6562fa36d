/*!
 * Nested Maps
 * Handle registry, outer table lookup and the nested table protocol
 */

mod outer;
mod protocol;
mod registry;

pub use outer::{OuterTableManager, TableRef};
pub use protocol::{NestedMapProtocol, ProtocolState};
pub use registry::HandleRegistry;

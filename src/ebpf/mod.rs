/*!
 * eBPF Module
 * Kernel map and program access, with a Linux backend and an in-memory one
 */

mod elf;
mod manager;
mod object;
mod simulation;
mod traits;
mod types;

#[cfg(target_os = "linux")]
pub mod linux;

pub use elf::{ElfError, ObjectFile};
pub use manager::select_backend;
pub use object::ExtensionObject;
pub use simulation::{SimOp, SimulatedKernel};
pub use traits::BpfSyscalls;
pub use types::*;

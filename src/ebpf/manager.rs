/*!
 * Backend Selection
 * Pick the kernel interface a run talks to
 */

use super::simulation::SimulatedKernel;
use super::traits::BpfSyscalls;
use super::types::BpfPlatform;
use crate::core::types::NestedResult;
use std::sync::Arc;
use tracing::info;

/// Verifier log captured for rejected programs on the Linux backend
const VERIFIER_LOG_SIZE: u32 = 64 * 1024;

/// Build the backend for `platform`
///
/// Linux is only available when compiled for Linux; asking for it elsewhere
/// is a configuration error rather than a silent fallback.
pub fn select_backend(platform: BpfPlatform) -> NestedResult<Arc<dyn BpfSyscalls>> {
    let backend: Arc<dyn BpfSyscalls> = match platform {
        BpfPlatform::Linux => linux_backend()?,
        BpfPlatform::Simulation => Arc::new(SimulatedKernel::new()),
    };
    info!(backend = %backend.platform(), "kernel backend selected");
    Ok(backend)
}

#[cfg(target_os = "linux")]
fn linux_backend() -> NestedResult<Arc<dyn BpfSyscalls>> {
    Ok(Arc::new(
        super::linux::LinuxBpf::new().with_verifier_log(VERIFIER_LOG_SIZE),
    ))
}

#[cfg(not(target_os = "linux"))]
fn linux_backend() -> NestedResult<Arc<dyn BpfSyscalls>> {
    let _ = VERIFIER_LOG_SIZE;
    Err(crate::core::errors::NestedMapError::Config(
        "the linux backend is not available on this platform".to_string(),
    ))
}

/*!
 * Resource Limits
 * Locked-memory limit raise required before any map creation
 */

use crate::core::errors::NestedMapError;
use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource, RLIM_INFINITY};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimitsError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("setrlimit failed: {0}")]
    Os(Errno),
}

impl From<LimitsError> for NestedMapError {
    fn from(e: LimitsError) -> Self {
        NestedMapError::ResourceLimit { reason: e.to_string() }
    }
}

/// Locked-memory limit to apply; `None` means unlimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub memlock_bytes: Option<u64>,
}

impl Limits {
    pub fn new() -> Self {
        Self { memlock_bytes: None }
    }

    pub fn with_memlock(mut self, bytes: u64) -> Self {
        self.memlock_bytes = Some(bytes);
        self
    }

    /// Value handed to `setrlimit` for both soft and hard limits
    fn memlock_raw(&self) -> u64 {
        self.memlock_bytes.unwrap_or(RLIM_INFINITY as u64)
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies process resource limits
#[derive(Debug, Default)]
pub struct LimitManager;

impl LimitManager {
    pub fn new() -> Self {
        Self
    }

    /// Current (soft, hard) locked-memory limit
    pub fn current(&self) -> Result<(u64, u64), LimitsError> {
        let (soft, hard) = getrlimit(Resource::RLIMIT_MEMLOCK).map_err(LimitsError::Os)?;
        Ok((soft as u64, hard as u64))
    }

    /// Raise `RLIMIT_MEMLOCK` for this process
    pub fn apply(&self, limits: &Limits) -> Result<(), LimitsError> {
        let target = limits.memlock_raw();
        if target == 0 {
            return Err(LimitsError::InvalidLimit("memlock limit of 0 bytes".to_string()));
        }

        if let Ok((soft, hard)) = self.current() {
            debug!(soft, hard, target, "current memlock limit");
        }

        setrlimit(Resource::RLIMIT_MEMLOCK, target as _, target as _).map_err(|errno| match errno {
            Errno::EPERM => {
                LimitsError::PermissionDenied("raising RLIMIT_MEMLOCK needs CAP_SYS_RESOURCE".to_string())
            }
            errno => LimitsError::Os(errno),
        })?;

        if limits.memlock_bytes.is_none() {
            info!("memlock limit raised to unlimited");
        } else {
            info!(bytes = target, "memlock limit set");
        }
        Ok(())
    }
}

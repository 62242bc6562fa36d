/*!
 * Guard Traits
 */

use super::{GuardError, GuardMetadata, GuardResult};

/// A kernel object owned by exactly one holder until released
pub trait Guard: Send {
    /// Short name used in trace events, e.g. `bpf_map`
    fn resource_type(&self) -> &'static str;

    fn metadata(&self) -> &GuardMetadata;

    /// False once [`release`](Guard::release) has run, whatever its outcome
    fn is_active(&self) -> bool;

    /// Give the object back to the kernel
    ///
    /// A second call yields `AlreadyReleased` and never reaches the kernel.
    fn release(&mut self) -> GuardResult<()>;

    /// Release if still held; errors go to [`Lifecycle::on_release_error`]
    fn release_on_drop(&mut self)
    where
        Self: Lifecycle + Sized,
    {
        if !self.is_active() {
            return;
        }
        if let Err(e) = self.release() {
            self.on_release_error(&e);
        }
    }
}

/// Trace hooks around a guard's acquire and release
pub trait Lifecycle: Guard {
    fn on_acquire(&self);

    fn on_release(&self);

    /// Must not panic: also runs from `Drop`
    fn on_release_error(&self, error: &GuardError);
}

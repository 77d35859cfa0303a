//! Blocking submission and scoped ownership of short-lived device objects

use crate::command::ClosedCommandList;
use crate::device::{CommandQueue, MemoryProvider};
use crate::types::{RegionId, ResourceId};
use gpucheck_core::Result;
use std::time::Duration;
use tracing::{debug, warn};

/// Execute `list` and block until the GPU has finished it.
///
/// A fresh fence is created per submission, signalled to 1 after the list,
/// waited on and released again.
pub fn submit_and_wait<Q>(queue: &Q, list: &ClosedCommandList, timeout: Option<Duration>) -> Result<()>
where
    Q: CommandQueue + ?Sized,
{
    let fence = queue.create_fence(0)?;

    let outcome = queue
        .execute(list)
        .and_then(|_| queue.signal(fence, 1))
        .and_then(|_| queue.wait(fence, 1, timeout));

    if let Err(e) = queue.release_fence(fence) {
        warn!("failed to release fence after '{}': {}", list.label(), e);
    }

    if outcome.is_ok() {
        gpucheck_core::gpucheck_debug_rate_limited!(
            gpucheck_core::LogCategory::Submission,
            "'{}' completed ({} commands)",
            list.label(),
            list.len()
        );
    }
    outcome
}

/// Releases a resource when dropped
pub struct OwnedResource<'d, D: MemoryProvider + ?Sized> {
    device: &'d D,
    id: ResourceId,
}

impl<'d, D: MemoryProvider + ?Sized> OwnedResource<'d, D> {
    pub fn new(device: &'d D, id: ResourceId) -> Self {
        Self { device, id }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Keep the resource alive and hand back its id
    pub fn into_id(self) -> ResourceId {
        let id = self.id;
        std::mem::forget(self);
        id
    }
}

impl<D: MemoryProvider + ?Sized> Drop for OwnedResource<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.release_resource(self.id) {
            debug!("release of {:?} failed: {}", self.id, e);
        }
    }
}

/// Releases a memory region when dropped
pub struct OwnedRegion<'d, D: MemoryProvider + ?Sized> {
    device: &'d D,
    id: RegionId,
}

impl<'d, D: MemoryProvider + ?Sized> OwnedRegion<'d, D> {
    pub fn new(device: &'d D, id: RegionId) -> Self {
        Self { device, id }
    }

    pub fn id(&self) -> RegionId {
        self.id
    }
}

impl<D: MemoryProvider + ?Sized> Drop for OwnedRegion<'_, D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.release_region(self.id) {
            debug!("release of {:?} failed: {}", self.id, e);
        }
    }
}

/// Convert a configured wait in milliseconds into a fence timeout
pub fn timeout_from_millis(wait_timeout_ms: Option<u64>) -> Option<Duration> {
    wait_timeout_ms.map(Duration::from_millis)
}

/// Milliseconds reported by a `Timeout` error, saturating at `u64::MAX`
pub fn timeout_millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_conversions() {
        assert_eq!(timeout_from_millis(Some(250)), Some(Duration::from_millis(250)));
        assert_eq!(timeout_from_millis(None), None);
        assert_eq!(timeout_millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(timeout_millis(Duration::MAX), u64::MAX);
    }
}

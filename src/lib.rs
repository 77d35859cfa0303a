//! gpucheck - GPU memory sub-allocation and render-target verification
//!
//! gpucheck is a toolkit for graphics regression tests. It places buffers
//! into shared memory arenas, uploads data into them, copies rendered
//! surfaces back to the host and compares them pixel by pixel against a
//! reference, writing a diff image when they disagree.

pub use gpucheck_capture;
pub use gpucheck_core;
pub use gpucheck_gpu;
pub use gpucheck_memory;

pub use gpucheck_capture::{Bitmap, ImageManager, RenderTargetComparison, Verification};
pub use gpucheck_core::{ConfigManager, GpuCheckConfig, GpuCheckError, Result};
pub use gpucheck_gpu::SoftwareDevice;
#[cfg(feature = "wgpu")]
pub use gpucheck_gpu::WgpuDevice;
pub use gpucheck_memory::{BufferAllocator, BufferRequest};

use std::path::Path;

/// Unified prelude module that exports all commonly used types
pub mod prelude {
    pub use gpucheck_capture::{
        Bitmap, ImageManager, PixelComparator, RenderTarget, RenderTargetComparison,
        RenderTargetScenario, Verification,
    };
    pub use gpucheck_core::prelude::*;
    pub use gpucheck_gpu::prelude::*;
    pub use gpucheck_memory::{BufferAllocator, BufferRequest};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Validate `config`, start logging and publish it as the global configuration.
///
/// Calling this again re-validates and re-initializes logging, but the first
/// published configuration stays global.
pub fn init(config: GpuCheckConfig) -> Result<()> {
    gpucheck_core::init(&config)?;
    if !ConfigManager::install(config) {
        tracing::debug!("global configuration already installed; keeping the first one");
    }
    Ok(())
}

/// [`init`] with a configuration file (`.json` or `.ron`)
pub fn init_from_file(path: impl AsRef<Path>) -> Result<()> {
    init(GpuCheckConfig::load(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_is_repeatable() {
        assert!(init(GpuCheckConfig::default()).is_ok());
        assert!(init(GpuCheckConfig::default()).is_ok());
        assert!(ConfigManager::instance().is_some());
    }
}

//! Core functionality for gpucheck
//!
//! This crate provides the pieces every other gpucheck crate builds on: the
//! error taxonomy, configuration, and category-filtered logging.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    CaptureConfig, ConfigManager, GpuCheckConfig, LoggingConfig, MemoryConfig,
    DEFAULT_PLACEMENT_ALIGNMENT,
};
pub use error::{ErrorContext, GpuCheckError, Result};
pub use logging::{CategoryFilter, LogCategory};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        config::{CaptureConfig, GpuCheckConfig, MemoryConfig},
        error::{ErrorContext, GpuCheckError, Result},
        logging::LogCategory,
    };
}

/// Framework version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging from the given configuration
pub fn init(config: &GpuCheckConfig) -> Result<()> {
    config.validate()?;

    if let Err(e) = logging::init(&config.logging) {
        return Err(GpuCheckError::config(format!(
            "Failed to initialize logging: {}",
            e
        )));
    }

    tracing::info!("gpucheck core v{} initialized", VERSION);
    Ok(())
}

//! Configuration system for gpucheck

use crate::error::{GpuCheckError, Result};
use crate::logging::LogCategory;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::level_filters::LevelFilter;

/// Default placement alignment for resources placed in a memory region (64 KiB).
pub const DEFAULT_PLACEMENT_ALIGNMENT: u64 = 64 * 1024;

/// Global configuration for gpucheck
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuCheckConfig {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Sub-allocator settings
    pub memory: MemoryConfig,
    /// Capture/compare settings
    pub capture: CaptureConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Category-specific log levels (category name -> level string)
    pub category_levels: HashMap<String, String>,
    /// Rate limiting duration in seconds
    pub rate_limit_seconds: u64,
    /// Maximum number of messages before rate limiting kicks in
    pub max_rate_limit_count: u32,
    /// Directive handed to the tracing subscriber when `RUST_LOG` is unset
    pub default_directive: String,
}

/// Sub-allocator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Size of each arena created for placed and reserved resources
    pub default_arena_size: u64,
    /// Alignment of every placement inside an arena
    pub placement_alignment: u64,
    /// Upper bound on a fence wait; `None` waits forever
    pub wait_timeout_ms: Option<u64>,
}

/// Capture/compare configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Route texture captures through aliased heap placements when the device allows it
    pub validate_heap_serialization: bool,
    /// Export every captured snapshot to `output_path`
    pub write_images_on_add: bool,
    pub output_path: PathBuf,
    /// Where the triptych diff image goes on a mismatch
    pub failure_artifact_path: PathBuf,
    /// File name prefix used by `export_all_images`
    pub export_prefix: String,
    /// Upper bound on a fence wait; `None` waits forever
    pub wait_timeout_ms: Option<u64>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let mut category_levels = HashMap::new();

        // Set default levels for each category
        category_levels.insert("memory".to_string(), "info".to_string());
        category_levels.insert("capture".to_string(), "info".to_string());
        category_levels.insert("compare".to_string(), "info".to_string());
        category_levels.insert("export".to_string(), "info".to_string());
        category_levels.insert("submission".to_string(), "warn".to_string()); // One line per fence is noise
        category_levels.insert("device".to_string(), "warn".to_string());

        Self {
            category_levels,
            rate_limit_seconds: 5,
            max_rate_limit_count: 10,
            default_directive: "info".to_string(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_arena_size: 4 * DEFAULT_PLACEMENT_ALIGNMENT,
            placement_alignment: DEFAULT_PLACEMENT_ALIGNMENT,
            wait_timeout_ms: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            validate_heap_serialization: false,
            write_images_on_add: false,
            output_path: PathBuf::from("Output.bmp"),
            failure_artifact_path: PathBuf::from("Failed.bmp"),
            export_prefix: "Image".to_string(),
            wait_timeout_ms: None,
        }
    }
}

impl GpuCheckConfig {
    /// Parse a JSON document
    pub fn from_json_str(source: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(source)
            .map_err(|e| GpuCheckError::config(format!("invalid JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a RON document
    pub fn from_ron_str(source: &str) -> Result<Self> {
        let config: Self = ron::from_str(source)
            .map_err(|e| GpuCheckError::config(format!("invalid RON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, picking the format from the extension (`.json` or `.ron`)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&source),
            Some("ron") => Self::from_ron_str(&source),
            other => Err(GpuCheckError::config(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Serialize to pretty JSON
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| GpuCheckError::config(format!("failed to serialize config: {}", e)))
    }

    /// Reject settings the allocator and capture engine cannot work with
    pub fn validate(&self) -> Result<()> {
        let alignment = self.memory.placement_alignment;
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(GpuCheckError::config(format!(
                "memory.placement_alignment must be a non-zero power of two, got {}",
                alignment
            )));
        }
        if self.memory.default_arena_size == 0 {
            return Err(GpuCheckError::config(
                "memory.default_arena_size must be non-zero",
            ));
        }
        for (category, level) in &self.logging.category_levels {
            category
                .parse::<LogCategory>()
                .map_err(|e| GpuCheckError::config(format!("logging.category_levels: {}", e)))?;
            level.parse::<LevelFilter>().map_err(|_| {
                GpuCheckError::config(format!(
                    "logging.category_levels.{}: unknown level '{}'",
                    category, level
                ))
            })?;
        }
        if self.capture.failure_artifact_path.as_os_str().is_empty() {
            return Err(GpuCheckError::config(
                "capture.failure_artifact_path must not be empty",
            ));
        }
        if self.capture.output_path.as_os_str().is_empty() {
            return Err(GpuCheckError::config("capture.output_path must not be empty"));
        }
        Ok(())
    }
}

/// Global configuration manager
pub struct ConfigManager {
    config: Arc<RwLock<GpuCheckConfig>>,
}

/// Global configuration manager instance
static CONFIG_MANAGER: OnceLock<ConfigManager> = OnceLock::new();

impl ConfigManager {
    /// Create a new configuration manager with default settings
    pub fn new() -> Self {
        Self::with_config(GpuCheckConfig::default())
    }

    /// Create a configuration manager with custom config
    pub fn with_config(config: GpuCheckConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Install the global instance; returns false if one was already installed
    pub fn install(config: GpuCheckConfig) -> bool {
        CONFIG_MANAGER.set(Self::with_config(config)).is_ok()
    }

    /// Get the global configuration manager instance
    pub fn instance() -> Option<&'static ConfigManager> {
        CONFIG_MANAGER.get()
    }

    /// Get a copy of the current configuration
    pub fn get_config(&self) -> GpuCheckConfig {
        self.config.read().clone()
    }

    /// Update the configuration
    pub fn update_config<F>(&self, updater: F)
    where
        F: FnOnce(&mut GpuCheckConfig),
    {
        let mut config = self.config.write();
        updater(&mut config);
    }

    /// Get the current logging configuration
    pub fn get_logging_config(&self) -> LoggingConfig {
        self.config.read().logging.clone()
    }

    pub fn get_memory_config(&self) -> MemoryConfig {
        self.config.read().memory.clone()
    }

    pub fn get_capture_config(&self) -> CaptureConfig {
        self.config.read().capture.clone()
    }

    /// Set log level for a specific category
    pub fn set_category_level(&self, category: &str, level: &str) {
        self.update_config(|config| {
            config
                .logging
                .category_levels
                .insert(category.to_string(), level.to_string());
        });
    }

    /// Get log level for a specific category
    pub fn get_category_level(&self, category: &str) -> Option<String> {
        self.config
            .read()
            .logging
            .category_levels
            .get(category)
            .cloned()
    }

    /// Toggle heap serialization validation for subsequent captures
    pub fn set_heap_serialization_validation(&self, enabled: bool) {
        self.update_config(|config| config.capture.validate_heap_serialization = enabled);
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_reference_harness() {
        let config = GpuCheckConfig::default();
        assert_eq!(config.memory.placement_alignment, 65536);
        assert_eq!(config.memory.default_arena_size, 4 * 65536);
        assert_eq!(config.capture.failure_artifact_path, PathBuf::from("Failed.bmp"));
        assert_eq!(config.capture.export_prefix, "Image");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_json_roundtrip_and_partial_documents() {
        let config = GpuCheckConfig::from_json_str(
            r#"{ "memory": { "default_arena_size": 1048576, "wait_timeout_ms": 250 } }"#,
        )
        .unwrap();

        assert_eq!(config.memory.default_arena_size, 1 << 20);
        assert_eq!(config.memory.wait_timeout_ms, Some(250));
        // Unspecified sections fall back to defaults
        assert_eq!(config.capture, CaptureConfig::default());

        let json = config.to_json_string().unwrap();
        assert_eq!(GpuCheckConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn test_ron_document() {
        let config = GpuCheckConfig::from_ron_str(
            r#"(capture: (validate_heap_serialization: true, export_prefix: "Frame"))"#,
        )
        .unwrap();

        assert!(config.capture.validate_heap_serialization);
        assert_eq!(config.capture.export_prefix, "Frame");
    }

    #[test]
    fn test_validate_rejects_bad_alignment() {
        let err = GpuCheckConfig::from_json_str(r#"{ "memory": { "placement_alignment": 1000 } }"#)
            .unwrap_err();
        assert!(matches!(err, GpuCheckError::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_unknown_log_categories() {
        let err = GpuCheckConfig::from_json_str(
            r#"{ "logging": { "category_levels": { "renderer": "info" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, GpuCheckError::Config { .. }));

        let err = GpuCheckConfig::from_json_str(
            r#"{ "logging": { "category_levels": { "memory": "loud" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, GpuCheckError::Config { .. }));

        assert!(GpuCheckConfig::from_json_str(
            r#"{ "logging": { "category_levels": { "memory": "trace", "device": "off" } } }"#,
        )
        .is_ok());
    }

    #[test]
    fn test_config_manager_updates() {
        let manager = ConfigManager::new();
        manager.set_category_level("capture", "debug");
        manager.set_heap_serialization_validation(true);

        assert_eq!(manager.get_category_level("capture").as_deref(), Some("debug"));
        assert!(manager.get_capture_config().validate_heap_serialization);
    }
}

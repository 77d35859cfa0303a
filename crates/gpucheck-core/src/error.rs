//! Error types for gpucheck

use std::collections::BTreeMap;
use thiserror::Error;

/// Context information for errors to aid in debugging
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    /// Operation that was being performed when the error occurred
    pub operation: String,
    /// Component or module where the error occurred
    pub component: String,
    /// Additional contextual data, kept ordered so log lines are stable
    pub metadata: BTreeMap<String, String>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            component: component.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Add metadata to the context
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.insert(key.into(), value.to_string());
        self
    }

    /// Format context for logging
    pub fn format_for_log(&self) -> String {
        let mut parts = vec![
            format!("operation={}", self.operation),
            format!("component={}", self.component),
        ];

        if !self.metadata.is_empty() {
            let metadata_str = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!("metadata=[{}]", metadata_str));
        }

        parts.join(", ")
    }
}

/// Main error type for gpucheck operations
#[derive(Debug, Error)]
pub enum GpuCheckError {
    /// The caller asked for a combination the allocator or device does not support.
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The memory provider refused a creation call.
    #[error("Allocation failure: {message}")]
    AllocationFailure {
        message: String,
        context: Option<ErrorContext>,
    },

    /// A handle that was never registered, or was already released.
    #[error("Unknown resource: {handle}")]
    UnknownResource { handle: String },

    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A GPU copy or map during surface capture did not complete.
    #[error("Capture failure: {message}")]
    CaptureFailure {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error(
        "Dimension mismatch: reference is {}x{}, candidate is {}x{}",
        .reference.0, .reference.1, .candidate.0, .candidate.1
    )]
    DimensionMismatch {
        reference: (u32, u32),
        candidate: (u32, u32),
    },

    /// Bytes read through aliased heap placements differ from a direct readback.
    #[error("Driver aliasing fault: {message}")]
    DriverAliasingFault { message: String },

    #[error("Timed out after {waited_ms} ms waiting for GPU completion")]
    Timeout { waited_ms: u64 },

    #[error("Device lost: {message}")]
    DeviceLost { message: String },

    #[error("Snapshot index {index} out of range (len {len})")]
    InvalidIndex { index: usize, len: usize },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GpuCheckError {
    /// Create an invalid-configuration error from a string
    pub fn invalid_configuration<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfiguration {
            message: msg.into(),
            context: None,
        }
    }

    /// Create an invalid-configuration error with context
    pub fn invalid_configuration_with_context<S: Into<String>>(
        msg: S,
        context: ErrorContext,
    ) -> Self {
        Self::InvalidConfiguration {
            message: msg.into(),
            context: Some(context),
        }
    }

    /// Create an allocation failure from a string
    pub fn allocation_failure<S: Into<String>>(msg: S) -> Self {
        Self::AllocationFailure {
            message: msg.into(),
            context: None,
        }
    }

    /// Create an allocation failure with context
    pub fn allocation_failure_with_context<S: Into<String>>(
        msg: S,
        context: ErrorContext,
    ) -> Self {
        Self::AllocationFailure {
            message: msg.into(),
            context: Some(context),
        }
    }

    /// Create a capture failure from a string
    pub fn capture_failure<S: Into<String>>(msg: S) -> Self {
        Self::CaptureFailure {
            message: msg.into(),
            context: None,
        }
    }

    /// Create a capture failure with context
    pub fn capture_failure_with_context<S: Into<String>>(msg: S, context: ErrorContext) -> Self {
        Self::CaptureFailure {
            message: msg.into(),
            context: Some(context),
        }
    }

    /// Create an unknown-resource error from anything printable (usually a slotmap key)
    pub fn unknown_resource(handle: impl std::fmt::Debug) -> Self {
        Self::UnknownResource {
            handle: format!("{:?}", handle),
        }
    }

    pub fn codec<S: Into<String>>(msg: S) -> Self {
        Self::Codec {
            message: msg.into(),
        }
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn device_lost<S: Into<String>>(msg: S) -> Self {
        Self::DeviceLost {
            message: msg.into(),
        }
    }

    /// Attach context to errors that carry one; other variants are returned unchanged
    pub fn with_context(self, context: ErrorContext) -> Self {
        match self {
            Self::InvalidConfiguration { message, .. } => Self::InvalidConfiguration {
                message,
                context: Some(context),
            },
            Self::AllocationFailure { message, .. } => Self::AllocationFailure {
                message,
                context: Some(context),
            },
            Self::CaptureFailure { message, .. } => Self::CaptureFailure {
                message,
                context: Some(context),
            },
            other => other,
        }
    }

    /// Get the error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::InvalidConfiguration { context, .. }
            | Self::AllocationFailure { context, .. }
            | Self::CaptureFailure { context, .. } => context.as_ref(),
            _ => None,
        }
    }

    /// Format error with context for logging
    pub fn format_for_log(&self) -> String {
        let base_msg = self.to_string();
        if let Some(context) = self.context() {
            format!("{} [{}]", base_msg, context.format_for_log())
        } else {
            base_msg
        }
    }
}

/// Result type alias for gpucheck operations
pub type Result<T> = std::result::Result<T, GpuCheckError>;

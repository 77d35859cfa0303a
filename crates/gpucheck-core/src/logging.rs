//! Category-filtered logging on top of `tracing`
//!
//! Every `gpucheck_*!` call names a [`LogCategory`]. The level configured for
//! that category in [`LoggingConfig`] decides whether the line reaches the
//! subscriber. Rate-limited sites share one window per category, so a tight
//! submission loop cannot flood the output. Lines emitted before [`init`]
//! pass straight through to whatever subscriber is installed.

use crate::config::LoggingConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub use tracing::Level;

/// The parts of gpucheck that log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    /// Arena creation and buffer placement
    Memory,
    /// Device backends: polling, rollbacks, adapter selection
    Device,
    /// Fence-backed command list submission
    Submission,
    Capture,
    Compare,
    Export,
}

impl LogCategory {
    pub const ALL: [LogCategory; 6] = [
        LogCategory::Memory,
        LogCategory::Device,
        LogCategory::Submission,
        LogCategory::Capture,
        LogCategory::Compare,
        LogCategory::Export,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogCategory::Memory => "memory",
            LogCategory::Device => "device",
            LogCategory::Submission => "submission",
            LogCategory::Capture => "capture",
            LogCategory::Compare => "compare",
            LogCategory::Export => "export",
        }
    }
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogCategory::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown log category '{}'", s))
    }
}

/// Open rate-limit window of one category
#[derive(Debug)]
struct Window {
    opened: Instant,
    lines: u32,
}

/// Per-category levels and rate limits resolved from a [`LoggingConfig`]
#[derive(Debug)]
pub struct CategoryFilter {
    levels: HashMap<LogCategory, LevelFilter>,
    default_level: LevelFilter,
    window: Duration,
    max_lines: u32,
    windows: Mutex<HashMap<LogCategory, Window>>,
}

impl CategoryFilter {
    /// Entries that do not parse are skipped; `GpuCheckConfig::validate`
    /// reports them before logging is initialized.
    pub fn new(config: &LoggingConfig) -> Self {
        let levels = config
            .category_levels
            .iter()
            .filter_map(|(category, level)| {
                Some((category.parse::<LogCategory>().ok()?, level.parse::<LevelFilter>().ok()?))
            })
            .collect();

        Self {
            levels,
            default_level: LevelFilter::INFO,
            window: Duration::from_secs(config.rate_limit_seconds),
            max_lines: config.max_rate_limit_count,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn level(&self, category: LogCategory) -> LevelFilter {
        self.levels
            .get(&category)
            .copied()
            .unwrap_or(self.default_level)
    }

    pub fn enabled(&self, category: LogCategory, level: Level) -> bool {
        level <= self.level(category)
    }

    /// Count one rate-limited line against `category`'s window
    pub fn admit(&self, category: LogCategory, now: Instant) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.entry(category).or_insert(Window {
            opened: now,
            lines: 0,
        });

        if now.saturating_duration_since(window.opened) >= self.window {
            window.opened = now;
            window.lines = 0;
        }
        if window.lines < self.max_lines {
            window.lines += 1;
            true
        } else {
            false
        }
    }
}

static FILTER: OnceLock<RwLock<CategoryFilter>> = OnceLock::new();

/// Initialize the logging system.
///
/// Installs the category filter and a `tracing-subscriber` fmt subscriber.
/// `RUST_LOG` takes precedence over `config.default_directive`. Calling this
/// again only swaps the category filter.
pub fn init(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if let Some(filter) = FILTER.get() {
        *filter.write() = CategoryFilter::new(config);
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.default_directive))?;
    FILTER.get_or_init(|| RwLock::new(CategoryFilter::new(config)));

    // A test harness or host application may already own the global subscriber
    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("global subscriber already set; keeping it");
    }
    Ok(())
}

/// Backend of the `gpucheck_*!` macros
#[doc(hidden)]
pub fn emit(level: Level, category: LogCategory, rate_limited: bool, args: fmt::Arguments<'_>) {
    if let Some(filter) = FILTER.get() {
        let filter = filter.read();
        if !filter.enabled(category, level) {
            return;
        }
        if rate_limited && !filter.admit(category, Instant::now()) {
            return;
        }
    }

    let category = category.as_str();
    if level == Level::ERROR {
        tracing::error!(category, "{}", args);
    } else if level == Level::WARN {
        tracing::warn!(category, "{}", args);
    } else if level == Level::INFO {
        tracing::info!(category, "{}", args);
    } else if level == Level::DEBUG {
        tracing::debug!(category, "{}", args);
    } else {
        tracing::trace!(category, "{}", args);
    }
}

#[macro_export]
macro_rules! gpucheck_debug {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Level::DEBUG, $category, false, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! gpucheck_info {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Level::INFO, $category, false, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! gpucheck_warn {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Level::WARN, $category, false, format_args!($($arg)*))
    };
}

/// Debug line counted against the category's rate-limit window
#[macro_export]
macro_rules! gpucheck_debug_rate_limited {
    ($category:expr, $($arg:tt)*) => {
        $crate::logging::emit($crate::logging::Level::DEBUG, $category, true, format_args!($($arg)*))
    };
}

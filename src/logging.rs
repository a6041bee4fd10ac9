//! Logging infrastructure - structured tracing for area events
//!
//! Design: Uses `tracing` for structured, contextual logging with:
//! - Configurable log levels per module
//! - Zero-cost when disabled
//! - Span-based performance tracking
//! - Console or file output

use once_cell::sync::OnceCell;
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

// Re-export tracing macros for use throughout the crate
pub use tracing::{debug, error, info, trace, warn, Level};

/// Global logging state; holds the file writer guard when logging to a file
static LOGGER: OnceCell<Option<WorkerGuard>> = OnceCell::new();

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default log level
    pub level: Level,
    /// Log file path (console when `None`)
    pub log_path: Option<String>,
    /// Enable JSON format (vs human-readable)
    pub json_format: bool,
    /// Show span events (enter/exit)
    pub show_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            log_path: None,
            json_format: false,
            show_spans: false,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // KERNEL_AREAS_LOG_LEVEL: trace, debug, info, warn, error
        if let Ok(level_str) = std::env::var("KERNEL_AREAS_LOG_LEVEL") {
            config.level = match level_str.to_lowercase().as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            };
        }

        if let Ok(path) = std::env::var("KERNEL_AREAS_LOG_FILE") {
            config.log_path = Some(path);
        }

        config.json_format = std::env::var("KERNEL_AREAS_LOG_JSON").is_ok();
        config.show_spans = std::env::var("KERNEL_AREAS_LOG_SPANS").is_ok();

        config
    }

    /// Verbose config for diagnosing area layout problems
    pub fn debug() -> Self {
        Self {
            level: Level::TRACE,
            log_path: None,
            json_format: false,
            show_spans: true,
        }
    }
}

/// Initialize logging with configuration from the environment
pub fn init() {
    init_with_config(LogConfig::from_env());
}

/// Initialize logging with custom configuration (idempotent)
pub fn init_with_config(config: LogConfig) {
    LOGGER.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "kernel_areas={}",
                config.level.as_str().to_lowercase()
            ))
        });

        let span_events = if config.show_spans {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };

        let (writer, guard) = match config.log_path.as_deref().map(Path::new) {
            Some(path) => {
                let directory = path.parent().unwrap_or_else(|| Path::new("."));
                let file_name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "kernel_areas.log".to_string());
                let appender = tracing_appender::rolling::never(directory, file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                (fmt::writer::BoxMakeWriter::new(writer), Some(guard))
            }
            None => (fmt::writer::BoxMakeWriter::new(io::stderr), None),
        };

        let layer = fmt::layer()
            .with_writer(writer)
            .with_span_events(span_events)
            .with_target(true)
            .with_thread_ids(cfg!(debug_assertions))
            .with_line_number(cfg!(debug_assertions));

        let layer = if config.json_format {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        };

        // Another subscriber may already be installed by the host
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init();

        guard
    });
}

/// Check if logging is initialized
pub fn is_initialized() -> bool {
    LOGGER.get().is_some()
}

// ============================================================================
// Area-specific logging functions
// ============================================================================

/// Log a fresh address-space reservation
pub fn log_reservation(base: usize, size: usize, forced_minimum: bool) {
    info!(
        event = "reservation",
        base = ?(base as *const u8),
        size_bytes = size,
        forced_minimum,
        "Address space reserved"
    );
}

/// Log area creation
#[inline]
pub fn log_area_created(kind: &str, low: usize, high: usize) {
    debug!(
        event = "area_created",
        kind,
        low = ?(low as *const u8),
        high = ?(high as *const u8),
        "Area created"
    );
}

/// Log area release
#[inline]
pub fn log_area_released(kind: &str, low: usize, high: usize) {
    debug!(
        event = "area_released",
        kind,
        low = ?(low as *const u8),
        high = ?(high as *const u8),
        "Area released"
    );
}

/// Log a heap resize
pub fn log_heap_resize(grew: bool, delta: usize, new_high: usize) {
    let event = if grew { "heap_grow" } else { "heap_shrink" };
    debug!(
        event,
        delta_bytes = delta,
        high = ?(new_high as *const u8),
        "Dynamic heap resized"
    );
}

/// Log page commitment
#[inline]
pub fn log_commit(addr: usize, len: usize) {
    trace!(
        event = "commit",
        address = ?(addr as *const u8),
        size_bytes = len,
        "Pages committed"
    );
}

/// Log page release back to the OS
#[inline]
pub fn log_uncommit(addr: usize, len: usize) {
    trace!(
        event = "uncommit",
        address = ?(addr as *const u8),
        size_bytes = len,
        "Pages uncommitted"
    );
}

/// Log a guard fault
pub fn log_guard_fault(kind: &str, addr: usize) {
    warn!(
        event = "guard_fault",
        guard = kind,
        address = ?(addr as *const u8),
        "Stack guard page hit"
    );
}

/// Log a recoverable failure that the caller will handle
pub fn log_memory_warning(warning: &str) {
    warn!(event = "memory_warning", warning, "Memory warning");
}

/// Performance tracking utilities
pub mod perf {
    use std::time::Instant;
    use tracing::debug;

    /// Track operation duration (returns guard that logs on drop)
    #[must_use]
    pub fn track(operation: &'static str) -> PerformanceGuard {
        PerformanceGuard {
            operation,
            start: Instant::now(),
        }
    }

    pub struct PerformanceGuard {
        operation: &'static str,
        start: Instant,
    }

    impl Drop for PerformanceGuard {
        fn drop(&mut self) {
            let elapsed = self.start.elapsed();
            debug!(
                operation = self.operation,
                duration_us = elapsed.as_micros() as u64,
                "operation completed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert!(config.log_path.is_none());

        let debug_config = LogConfig::debug();
        assert_eq!(debug_config.level, Level::TRACE);
        assert!(debug_config.show_spans);
    }

    #[test]
    fn test_init_idempotent() {
        init();
        init();
        assert!(is_initialized());
    }

    #[test]
    fn test_logging_functions() {
        log_reservation(0x1000, 4096, false);
        log_area_created("dynamic", 0x1000, 0x2000);
        log_area_released("value stack", 0x1000, 0x2000);
        log_heap_resize(true, 4096, 0x3000);
        log_commit(0x1000, 4096);
        log_uncommit(0x1000, 4096);
        log_guard_fault("soft", 0x1000);
        log_memory_warning("test");
        let _guard = perf::track("test");
    }
}

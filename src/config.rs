//! Memory configuration - platform constants resolved once at startup
//!
//! Every size the area code depends on lives here: page and segment
//! granularity, the reservation layout, collection thresholds and the
//! guard/minimum sizes of each stack kind. Values come from three places,
//! in increasing precedence:
//!
//! 1. `Default` (64-bit layout)
//! 2. a TOML file (`MemoryConfig::load` / `MemoryConfig::parse`)
//! 3. `KERNEL_AREAS_*` environment variables (`MemoryConfig::from_env`)
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `KERNEL_AREAS_HEAP_RESERVE` | Bytes of address space to reserve |
//! | `KERNEL_AREAS_STACK_SIZE` | Initial thread control stack size |
//! | `KERNEL_AREAS_THREAD_STACK_SIZE` | Control stack size for new threads |
//! | `KERNEL_AREAS_GC_THRESHOLD` | Dynamic heap free-space target |
//! | `KERNEL_AREAS_G0_THRESHOLD` ... `G2_THRESHOLD` | Generation thresholds |
//! | `KERNEL_AREAS_EGC` | Enable incremental collection (`true`/`false`) |
//!
//! Size values accept `K`, `M` and `G` suffixes and `0x` hex prefixes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::generation::GenerationThresholds;

pub const DEFAULT_HEAP_SEGMENT_SIZE: usize = 1 << 17;
pub const DEFAULT_DNODE_SIZE: usize = 2 * core::mem::size_of::<usize>();
pub const DEFAULT_HEAP_GC_THRESHOLD: usize = 32 << 20;
pub const DEFAULT_INITIAL_STACK_SIZE: usize = 2 << 20;

#[cfg(target_pointer_width = "64")]
pub const MAXIMUM_MAPPABLE_MEMORY: usize = 512 << 30;
#[cfg(not(target_pointer_width = "64"))]
pub const MAXIMUM_MAPPABLE_MEMORY: usize = 1 << 30;

#[cfg(target_pointer_width = "64")]
const DEFAULT_PREFERRED_BASE: Option<usize> = Some(0x3000_0000_0000);
#[cfg(not(target_pointer_width = "64"))]
const DEFAULT_PREFERRED_BASE: Option<usize> = None;

/// Guard and minimum sizes for one kind of stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackGuards {
    /// Bytes of recoverable guard below the usable area
    pub soft: usize,
    /// Bytes of fatal guard below the soft guard
    pub hard: usize,
    /// Smallest usable size handed out for this kind
    pub min_size: usize,
}

/// All platform constants consumed by the area code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub page_size: usize,
    /// Heap growth quantum; every heap boundary is a multiple of this
    pub heap_segment_size: usize,
    /// Collector allocation unit; mark bits hold one bit per dnode
    pub dnode_size: usize,
    pub max_mappable_memory: usize,
    pub reserved_area_size: usize,
    /// Address hint for the reservation; the OS may place it elsewhere
    pub preferred_base: Option<usize>,
    pub readonly_reserve: usize,
    pub static_reserve: usize,
    pub heap_gc_threshold: usize,
    pub thresholds: GenerationThresholds,
    pub incremental_collection: bool,
    pub value_stack: StackGuards,
    pub aux_stack: StackGuards,
    pub control_stack: StackGuards,
    pub initial_stack_size: usize,
    /// Control stack size for threads after the first; 0 means "same as initial"
    pub thread_stack_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            page_size: crate::os::page_size(),
            heap_segment_size: DEFAULT_HEAP_SEGMENT_SIZE,
            dnode_size: DEFAULT_DNODE_SIZE,
            max_mappable_memory: MAXIMUM_MAPPABLE_MEMORY,
            reserved_area_size: MAXIMUM_MAPPABLE_MEMORY,
            preferred_base: DEFAULT_PREFERRED_BASE,
            readonly_reserve: 128 << 20,
            static_reserve: 1 << 20,
            heap_gc_threshold: DEFAULT_HEAP_GC_THRESHOLD,
            thresholds: GenerationThresholds::default(),
            incremental_collection: true,
            value_stack: StackGuards {
                soft: 1 << 16,
                hard: 1 << 12,
                min_size: 1 << 16,
            },
            aux_stack: StackGuards {
                soft: 1 << 16,
                hard: 1 << 12,
                min_size: 1 << 18,
            },
            control_stack: StackGuards {
                soft: 100 << 10,
                hard: 100 << 10,
                min_size: 1 << 17,
            },
            initial_stack_size: DEFAULT_INITIAL_STACK_SIZE,
            thread_stack_size: 0,
        }
    }
}

impl MemoryConfig {
    /// Small layout for tests and embedding hosts: a reservation of a few
    /// megabytes instead of the full mappable range
    pub fn minimal() -> Self {
        let page_size = crate::os::page_size();
        let segment = (64 << 10).max(page_size);
        Self {
            page_size,
            heap_segment_size: segment,
            reserved_area_size: 64 * segment,
            preferred_base: None,
            readonly_reserve: 4 * segment,
            static_reserve: segment,
            heap_gc_threshold: 4 * segment,
            thresholds: GenerationThresholds {
                g0: segment,
                g1: 2 * segment,
                g2: 4 * segment,
            },
            value_stack: StackGuards {
                soft: 2 * page_size,
                hard: page_size,
                min_size: 4 * page_size,
            },
            aux_stack: StackGuards {
                soft: 2 * page_size,
                hard: page_size,
                min_size: 4 * page_size,
            },
            control_stack: StackGuards {
                soft: 2 * page_size,
                hard: 2 * page_size,
                min_size: 8 * page_size,
            },
            initial_stack_size: 16 * page_size,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string and validate it
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `KERNEL_AREAS_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `KERNEL_AREAS_*` variables onto this configuration
    pub fn apply_env(&mut self) {
        if let Some(size) = env_size("KERNEL_AREAS_HEAP_RESERVE", self.reserved_area_size) {
            if size <= self.max_mappable_memory {
                self.reserved_area_size = size;
            }
        }
        if let Some(size) = env_size("KERNEL_AREAS_STACK_SIZE", self.initial_stack_size) {
            if size >= self.control_stack.min_size {
                self.initial_stack_size = size;
            }
        }
        if let Some(size) = env_size("KERNEL_AREAS_THREAD_STACK_SIZE", self.thread_stack_size) {
            if size >= self.control_stack.min_size {
                self.thread_stack_size = size;
            }
        }
        if let Some(size) = env_size("KERNEL_AREAS_GC_THRESHOLD", self.heap_gc_threshold) {
            self.heap_gc_threshold = size;
        }
        if let Some(size) = env_size("KERNEL_AREAS_G0_THRESHOLD", self.thresholds.g0) {
            self.thresholds.g0 = size;
        }
        if let Some(size) = env_size("KERNEL_AREAS_G1_THRESHOLD", self.thresholds.g1) {
            self.thresholds.g1 = size;
        }
        if let Some(size) = env_size("KERNEL_AREAS_G2_THRESHOLD", self.thresholds.g2) {
            self.thresholds.g2 = size;
        }
        if let Ok(val) = std::env::var("KERNEL_AREAS_EGC") {
            self.incremental_collection = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    /// Check granularity constraints and clamp the reservation to what the
    /// platform can map
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "page size {} is not a power of two",
                self.page_size
            )));
        }
        if !self.heap_segment_size.is_power_of_two() || self.heap_segment_size < self.page_size {
            return Err(ConfigError::Invalid(format!(
                "heap segment size {} must be a power of two no smaller than a page",
                self.heap_segment_size
            )));
        }
        if !self.dnode_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "dnode size {} is not a power of two",
                self.dnode_size
            )));
        }
        for (name, size) in [
            ("readonly_reserve", self.readonly_reserve),
            ("static_reserve", self.static_reserve),
        ] {
            if size % self.heap_segment_size != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) is not a multiple of the heap segment size",
                    name, size
                )));
            }
        }
        if self.heap_gc_threshold == 0 {
            return Err(ConfigError::Invalid("heap_gc_threshold must be non-zero".into()));
        }
        self.reserved_area_size = self.reserved_area_size.min(self.max_mappable_memory);
        Ok(())
    }

    /// Smallest reservation that can hold the constant-data allowance plus a
    /// heap twice the default collection threshold
    pub fn minimum_reservation(&self) -> usize {
        align_up(
            self.readonly_reserve + self.static_reserve + 2 * self.heap_gc_threshold,
            self.heap_segment_size,
        )
    }

    /// Guard sizes configured for a stack kind
    pub fn stack_guards(&self, kind: crate::area::AreaKind) -> Option<StackGuards> {
        use crate::area::AreaKind;
        match kind {
            AreaKind::ValueStack => Some(self.value_stack),
            AreaKind::AuxStack => Some(self.aux_stack),
            AreaKind::ControlStack => Some(self.control_stack),
            _ => None,
        }
    }

    /// Control stack size for a newly created thread
    pub fn effective_thread_stack_size(&self) -> usize {
        if self.thread_stack_size == 0 {
            self.initial_stack_size
        } else {
            self.thread_stack_size
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Read(String),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(msg) => write!(f, "Failed to read memory config: {}", msg),
            Self::Parse(msg) => write!(f, "Failed to parse memory config: {}", msg),
            Self::Invalid(msg) => write!(f, "Invalid memory config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

fn env_size(name: &str, default: usize) -> Option<usize> {
    std::env::var(name).ok().map(|val| parse_size(&val).unwrap_or(default))
}

/// Parse a byte count such as `512M`, `64k`, `0x10000` or `4G`
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 10),
        'm' | 'M' => (&text[..text.len() - 1], 20),
        'g' | 'G' => (&text[..text.len() - 1], 30),
        _ => (text, 0),
    };

    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<usize>().ok()?
    };

    value.checked_mul(1usize << shift)
}

/// Round `value` up to a multiple of `align` (a power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// `align_up`, or `None` when the rounded value does not fit in a `usize`
#[inline]
pub const fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `align` (a power of two)
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64k"), Some(64 << 10));
        assert_eq!(parse_size("512M"), Some(512 << 20));
        assert_eq!(parse_size("2g"), Some(2 << 30));
        assert_eq!(parse_size("0x10000"), Some(0x10000));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size(""), None);
    }

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(checked_align_up(4097, 4096), Some(8192));
        assert_eq!(checked_align_up(usize::MAX - 10, 4096), None);
    }

    #[test]
    fn default_config_validates() {
        let mut config = MemoryConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.reserved_area_size <= config.max_mappable_memory);
    }

    #[test]
    fn minimal_config_validates() {
        let mut config = MemoryConfig::minimal();
        assert!(config.validate().is_ok());
        assert!(config.reserved_area_size >= config.minimum_reservation());
    }

    #[test]
    fn minimum_reservation_is_segment_aligned() {
        let config = MemoryConfig::default();
        let min = config.minimum_reservation();
        assert_eq!(min % config.heap_segment_size, 0);
        assert!(
            min >= config.readonly_reserve + config.static_reserve + 2 * config.heap_gc_threshold
        );
    }

    #[test]
    fn parse_toml_overrides_defaults() {
        let config = MemoryConfig::parse(
            r#"
            heap_gc_threshold = 1048576
            incremental_collection = false

            [thresholds]
            g0 = 65536
            g1 = 131072
            g2 = 262144
            "#,
        )
        .expect("valid config");

        assert_eq!(config.heap_gc_threshold, 1 << 20);
        assert!(!config.incremental_collection);
        assert_eq!(config.thresholds.g1, 131072);
        assert_eq!(config.heap_segment_size, DEFAULT_HEAP_SEGMENT_SIZE);
    }

    #[test]
    fn parse_rejects_bad_segment() {
        let err = MemoryConfig::parse("heap_segment_size = 3000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn parse_reports_syntax_errors() {
        let err = MemoryConfig::parse("heap_gc_threshold = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn validate_clamps_reservation() {
        let mut config = MemoryConfig::default();
        config.reserved_area_size = config.max_mappable_memory * 2;
        config.validate().unwrap();
        assert_eq!(config.reserved_area_size, config.max_mappable_memory);
    }

    #[test]
    fn load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "static_reserve = {}", 2 * DEFAULT_HEAP_SEGMENT_SIZE).unwrap();

        let config = MemoryConfig::load(file.path()).expect("config file");
        assert_eq!(config.static_reserve, 2 * DEFAULT_HEAP_SEGMENT_SIZE);
    }

    #[test]
    fn thread_stack_size_falls_back_to_initial() {
        let mut config = MemoryConfig::default();
        assert_eq!(config.effective_thread_stack_size(), config.initial_stack_size);
        config.thread_stack_size = 1 << 20;
        assert_eq!(config.effective_thread_stack_size(), 1 << 20);
    }
}

//! Kernel Areas - memory substrate for a managed-language runtime
//!
//! This crate reserves the process's address space and carves it into
//! typed areas: a read-only and a static area, a dynamic heap that grows
//! and shrinks in segments, the generation chain an incremental collector
//! walks, and guarded stacks whose protected pages turn overflow into a
//! recoverable (soft) or fatal (hard) fault.
//!
//! All state lives in one `MemoryManager`; every mutation happens under its
//! region lock.

pub mod area;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod fault;
pub mod generation;
pub mod heap;
pub mod logging;
pub mod manager;
pub mod os;
pub mod reserve;
pub mod stack;

// Re-export core types
pub use area::{Area, AreaId, AreaKind, Areas};
pub use bootstrap::{
    boot, boot_or_exit, BootedHeap, HeapImage, HeapImageLoader, ImageLoadError, NativeStack,
};
pub use config::{ConfigError, MemoryConfig, StackGuards};
pub use error::{FatalError, FatalStep, MemoryError, Result};
pub use fault::{classify_fault, FaultKind, FaultResponse};
pub use generation::{GenerationThresholds, Generations};
pub use manager::{AreaLock, MemoryManager};
pub use os::{OsError, SystemMemory, VirtualMemory};
pub use reserve::{GcTables, Reservation, TableSizes};
pub use stack::{GuardId, GuardKind, Guards, ProtectedArea, ThreadStackSizes, ThreadStacks};

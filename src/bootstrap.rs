//! Bootstrap - bring the memory substrate up in startup order
//!
//! 1. Reserve address space, backing off until the OS agrees
//! 2. Load the heap image (layout only; contents are the loader's business)
//! 3. Carve the first dynamic area and size it for the collection threshold
//! 4. Create the elder generations for generational images
//! 5. Register the native stack and allocate the initial thread's stacks
//!
//! Every failure here is fatal; `boot_or_exit` reports it and exits.

use core::fmt;

use crate::area::AreaId;
use crate::config::{MemoryConfig, DEFAULT_HEAP_GC_THRESHOLD};
use crate::error::{FatalError, FatalStep, MemoryError};
use crate::generation::{GenerationThresholds, Generations};
use crate::logging::{info, log_memory_warning, perf};
use crate::manager::MemoryManager;
use crate::reserve::Reservation;
use crate::stack::{ThreadStackSizes, ThreadStacks};

/// Heap layout recovered from a persisted image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapImage {
    /// Bytes of the dynamic heap in use once the image is loaded
    pub heap_size: usize,
    /// Collection threshold saved with the image; `None` for images that
    /// predate saved parameters
    pub heap_threshold: Option<usize>,
    pub generation_thresholds: GenerationThresholds,
    pub incremental_collection: bool,
    /// The image expects g1, g2 and tenured areas
    pub generational: bool,
    /// Address of the image's root object
    pub root: usize,
    pub static_dnodes: usize,
    pub static_used: usize,
}

/// Image could not be read or is malformed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLoadError {
    pub message: String,
}

impl ImageLoadError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ImageLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to load heap image: {}", self.message)
    }
}

impl std::error::Error for ImageLoadError {}

/// Source of the initial heap layout
pub trait HeapImageLoader {
    fn load(&mut self, config: &MemoryConfig) -> Result<HeapImage, ImageLoadError>;
}

/// The initial thread's stack as the OS set it up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeStack {
    /// High end of the stack
    pub bottom: usize,
    pub size: usize,
}

/// Everything created during startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootedHeap {
    pub reservation: Reservation,
    pub dynamic: AreaId,
    pub generations: Option<Generations>,
    pub native_stack: Option<AreaId>,
    pub thread_stacks: ThreadStacks,
    pub root: usize,
    /// Free-space target in effect after startup
    pub heap_threshold: usize,
    pub incremental_collection: bool,
}

fn fatal(step: FatalStep) -> impl FnOnce(MemoryError) -> FatalError {
    move |err| match err {
        MemoryError::Fatal(fatal) => fatal,
        other => FatalError::new(step, other.to_string()),
    }
}

/// Run the startup sequence against `manager`
pub fn boot(
    manager: &MemoryManager,
    loader: &mut dyn HeapImageLoader,
    native_stack: Option<NativeStack>,
) -> Result<BootedHeap, FatalError> {
    let _perf = perf::track("boot");
    let config = manager.config();

    let reservation = manager
        .reserve_with_backoff(config.reserved_area_size)
        .map_err(fatal(FatalStep::Reservation))?;

    let image = loader
        .load(config)
        .map_err(|err| FatalError::new(FatalStep::ImageLoad, err.message))?;

    let mut lock = manager.lock();
    let dynamic = lock
        .allocate_dynamic_area(image.heap_size)
        .map_err(fatal(FatalStep::FirstHeapAllocation))?;
    if let Some(area) = lock.state.areas.get_mut(dynamic) {
        area.static_dnodes = image.static_dnodes;
        area.static_used = image.static_used;
    }

    // Saved parameters apply unless the threshold was configured explicitly
    let saved = image
        .heap_threshold
        .filter(|_| config.heap_gc_threshold == DEFAULT_HEAP_GC_THRESHOLD);
    let (heap_threshold, thresholds, incremental_collection) = match saved {
        Some(threshold) => (
            threshold,
            image.generation_thresholds,
            image.incremental_collection,
        ),
        None => (
            config.heap_gc_threshold,
            config.thresholds,
            config.incremental_collection,
        ),
    };

    match lock.resize_dynamic_heap(image.heap_size, heap_threshold) {
        Ok(true) => {}
        Ok(false) => log_memory_warning("heap could not be sized for the collection threshold"),
        Err(err) => return Err(fatal(FatalStep::FirstHeapAllocation)(err)),
    }

    let mut generations = None;
    if image.generational {
        generations = Some(
            lock.create_placeholder_generations(thresholds)
                .map_err(fatal(FatalStep::FirstHeapAllocation))?,
        );
        if incremental_collection {
            lock.enable_incremental_collection()
                .map_err(fatal(FatalStep::FirstHeapAllocation))?;
        }
    }
    drop(lock);

    let native_stack = match native_stack {
        Some(stack) => {
            manager.ensure_stack_limit(config.initial_stack_size)?;
            Some(
                manager
                    .register_native_stack(stack.bottom, stack.size)
                    .map_err(fatal(FatalStep::StackAllocation))?,
            )
        }
        None => None,
    };

    let sizes = ThreadStackSizes {
        value: config.initial_stack_size,
        aux: config.aux_stack.min_size,
        control: config.initial_stack_size,
    };
    let thread_stacks = manager
        .allocate_thread_stacks(sizes)
        .map_err(fatal(FatalStep::StackAllocation))?;

    info!(
        event = "boot",
        reserved_bytes = reservation.size,
        heap_bytes = image.heap_size,
        heap_threshold,
        generational = image.generational,
        incremental_collection,
        "Memory substrate ready"
    );

    Ok(BootedHeap {
        reservation,
        dynamic,
        generations,
        native_stack,
        thread_stacks,
        root: image.root,
        heap_threshold,
        incremental_collection: incremental_collection && image.generational,
    })
}

/// `boot`, terminating the process on failure
pub fn boot_or_exit(
    manager: &MemoryManager,
    loader: &mut dyn HeapImageLoader,
    native_stack: Option<NativeStack>,
) -> BootedHeap {
    match boot(manager, loader, native_stack) {
        Ok(booted) => booted,
        Err(err) => err.terminate(),
    }
}

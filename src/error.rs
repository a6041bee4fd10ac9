//! Error taxonomy for area operations
//!
//! OS failures are converted where they happen into one of three outcomes:
//! a recoverable `MemoryError` (`TooSmall`, `OutOfMemory`), a contract
//! violation by the caller, or a `FatalError` that ends the process.

use core::fmt;

use crate::area::{AreaId, AreaKind};
use crate::logging::error;

/// Startup or allocation step whose failure leaves no usable memory substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalStep {
    Reservation,
    FirstHeapAllocation,
    StackAllocation,
    StackLimit,
    ImageLoad,
}

impl FatalStep {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Reservation => "address space reservation",
            Self::FirstHeapAllocation => "initial heap allocation",
            Self::StackAllocation => "stack allocation",
            Self::StackLimit => "stack resource limit",
            Self::ImageLoad => "heap image load",
        }
    }

    /// Process exit status; image problems are distinguished from memory
    /// exhaustion so the caller can tell them apart
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ImageLoad => 2,
            _ => 1,
        }
    }
}

/// Unrecoverable failure: report and terminate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalError {
    pub step: FatalStep,
    pub detail: String,
}

impl FatalError {
    pub fn new(step: FatalStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            detail: detail.into(),
        }
    }

    /// Print a one-line diagnostic and exit with a non-zero status
    pub fn terminate(&self) -> ! {
        error!(
            event = "fatal",
            step = self.step.describe(),
            detail = %self.detail,
            "Unrecoverable memory failure"
        );
        eprintln!("{}", self);
        std::process::exit(self.step.exit_code())
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fatal error in {}: {}", self.step.describe(), self.detail)
    }
}

impl std::error::Error for FatalError {}

/// Area operation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The OS refused a reservation of this many bytes
    TooSmall { requested: usize },
    /// Not enough memory for a stack or heap extension of this many bytes
    OutOfMemory { requested: usize },
    StaleHandle,
    NotRegistered(AreaId),
    AlreadyRegistered(AreaId),
    WrongKind { expected: &'static str, found: AreaKind },
    ReservationExists,
    NoReservation,
    DynamicAreaExists,
    NoDynamicArea,
    GenerationsExist,
    NoGenerations,
    Fatal(FatalError),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooSmall { requested } => {
                write!(f, "Could not reserve {} bytes of address space", requested)
            }
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory allocating {} bytes", requested)
            }
            Self::StaleHandle => write!(f, "Area handle refers to a released area"),
            Self::NotRegistered(id) => write!(f, "Area {} is not registered", id),
            Self::AlreadyRegistered(id) => write!(f, "Area {} is already registered", id),
            Self::WrongKind { expected, found } => {
                write!(f, "Expected {} area, found {}", expected, found)
            }
            Self::ReservationExists => write!(f, "Address space has already been reserved"),
            Self::NoReservation => write!(f, "No address space reservation exists"),
            Self::DynamicAreaExists => write!(f, "Dynamic heap area already allocated"),
            Self::NoDynamicArea => write!(f, "No dynamic heap area allocated"),
            Self::GenerationsExist => write!(f, "Generation areas already created"),
            Self::NoGenerations => write!(f, "Generation areas have not been created"),
            Self::Fatal(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for MemoryError {}

impl From<FatalError> for MemoryError {
    fn from(err: FatalError) -> Self {
        Self::Fatal(err)
    }
}

pub type Result<T> = core::result::Result<T, MemoryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_message_names_step() {
        let err = FatalError::new(FatalStep::FirstHeapAllocation, "reserved area too small");
        let msg = err.to_string();
        assert!(msg.contains("initial heap allocation"));
        assert!(msg.contains("reserved area too small"));
        assert!(!msg.contains('\n'));
    }

    #[test]
    fn image_load_has_distinct_exit_code() {
        assert_ne!(
            FatalStep::ImageLoad.exit_code(),
            FatalStep::Reservation.exit_code()
        );
        assert_ne!(FatalStep::StackAllocation.exit_code(), 0);
    }

    #[test]
    fn fatal_converts_into_memory_error() {
        let err: MemoryError = FatalError::new(FatalStep::Reservation, "mmap").into();
        assert!(matches!(err, MemoryError::Fatal(ref f) if f.step == FatalStep::Reservation));
    }
}

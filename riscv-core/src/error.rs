//! Error kinds raised by the emulator core.
//!
//! Every fault the CPU or memory subsystem can raise is represented here.
//! Faults are first offered to the CPU's `fault_handler` (§7 of the design
//! spec); if that hook is absent or declines to repair the state, the error
//! propagates out of `Machine::simulate` to the caller.

use thiserror::Error;

/// A single emulator fault, with the numeric datum (faulting address, page
/// count, etc.) that caused it when one is meaningful.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RiscvError {
    #[error("protection fault accessing {addr:#x}")]
    ProtectionFault { addr: u64 },

    #[error("execute-space protection fault at pc {pc:#x}")]
    ExecutionSpaceProtectionFault { pc: u64 },

    #[error("illegal opcode {raw:#x} at pc {pc:#x}")]
    IllegalOpcode { pc: u64, raw: u32 },

    #[error("illegal operation: {reason}")]
    IllegalOperation { reason: &'static str },

    #[error("invalid alignment accessing {addr:#x} ({width} bytes)")]
    InvalidAlignment { addr: u64, width: u8 },

    #[error("invalid program: {reason}")]
    InvalidProgram { reason: &'static str },

    #[error("out of memory: {pages_max} pages exceeded")]
    OutOfMemory { pages_max: u64 },

    #[error("feature disabled: {feature}")]
    FeatureDisabled { feature: &'static str },

    #[error("deadlock reached: no runnable thread")]
    DeadlockReached,

    #[error("unhandled syscall {number}")]
    UnhandledSyscall { number: u64 },

    #[error("unimplemented instruction length {length}")]
    UnimplementedInstructionLength { length: u8 },

    #[error("instruction budget of {max} exhausted")]
    Timeout { max: u64 },
}

impl RiscvError {
    /// Numeric code matching spec.md §7's error-kind table (stable across
    /// versions; useful for host programs that match on error class).
    pub fn code(&self) -> i32 {
        match self {
            RiscvError::ProtectionFault { .. } => 1,
            RiscvError::ExecutionSpaceProtectionFault { .. } => 2,
            RiscvError::IllegalOpcode { .. } => 3,
            RiscvError::IllegalOperation { .. } => 4,
            RiscvError::InvalidAlignment { .. } => 5,
            RiscvError::InvalidProgram { .. } => 6,
            RiscvError::OutOfMemory { .. } => 7,
            RiscvError::FeatureDisabled { .. } => 8,
            RiscvError::DeadlockReached => 9,
            RiscvError::UnhandledSyscall { .. } => 10,
            RiscvError::UnimplementedInstructionLength { .. } => 11,
            RiscvError::Timeout { .. } => 12,
        }
    }
}

pub type Result<T> = core::result::Result<T, RiscvError>;

//! User-space emulator core for the RISC-V instruction set (RV32/64/128,
//! extensions M/A/F/D/C and a Zba/Zbb subset).
//!
//! The crate is organized the way spec.md §3 lays out the subsystem: a
//! paged, copy-on-write `memory` module; a `decode`r that compiles raw
//! bytes into a cached dispatch token per execute segment; a `cpu` that
//! steps one decoded instruction at a time against an explicit `Memory`
//! parameter (see `machine` for why); an `elf` loader; cooperative
//! `task` scheduling and `signal` delivery for the guest's own
//! userland threading; a minimal `syscall` bootstrap set; and the
//! `Machine` aggregate that owns all of the above. `multiprocess`
//! layers a host-thread pool of independent `Machine`s on top.
//!
//! Out of scope (spec.md §1): supervisor-mode CSRs, page tables, and a
//! full POSIX emulation layer — the host program is expected to supply
//! those as a syscall layer on top of `Machine::install_syscall_handler`.

pub mod cpu;
pub mod decode;
pub mod elf;
pub mod error;
pub mod machine;
pub mod memory;
pub mod multiprocess;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod xlen;

pub use cpu::{Cpu, StepOutcome};
pub use elf::MachineOptions;
pub use error::{Result, RiscvError};
pub use machine::{GuestArg, IntoGuestArg, Machine, VmTarget};
pub use memory::Memory;
pub use multiprocess::VcpuPool;
pub use xlen::Xlen;

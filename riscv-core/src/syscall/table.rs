//! The minimal bootstrap syscall set wired directly into the core, plus the
//! registration table for embedder-installed handlers (spec.md §4.5's
//! `install_syscall_handler`).
//!
//! The full POSIX layer is explicitly out of scope (spec.md §1); this table
//! carries only the handful of syscalls needed to run the end-to-end
//! scenarios in spec.md §8 (exit, write, brk/mmap, futex, signals, clock,
//! gettid) so the core is self-testable without an external syscall crate.
//! Grounded in table-driven shape on
//! `examples/ryanbreen-breenix/kernel/src/syscall/table.rs`.

pub const SYS_EXIT: u64 = 93;
pub const SYS_EXIT_GROUP: u64 = 94;
pub const SYS_WRITE: u64 = 64;
pub const SYS_BRK: u64 = 214;
pub const SYS_MUNMAP: u64 = 215;
pub const SYS_MMAP: u64 = 222;
pub const SYS_FUTEX: u64 = 98;
pub const SYS_RT_SIGACTION: u64 = 134;
pub const SYS_RT_SIGRETURN: u64 = 139;
pub const SYS_CLOCK_GETTIME: u64 = 113;
pub const SYS_GETTID: u64 = 178;

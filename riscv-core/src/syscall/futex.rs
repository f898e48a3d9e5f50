//! Futex WAIT/WAKE, keyed by `(thread_group_id, vaddr)` (spec.md §4.6).
//!
//! Grounded on `examples/ryanbreen-breenix/kernel/src/syscall/futex.rs`'s
//! queue keying and WAIT/WAKE split; simplified to a single-process emulator
//! core where `thread_group_id` is always the owning Machine's, so the key
//! collapses to the guest virtual address alone (the Machine boundary
//! already provides the isolation the thread-group id gave the teacher).

pub const FUTEX_WAIT: u32 = 0;
pub const FUTEX_WAKE: u32 = 1;
const FUTEX_CMD_MASK: u32 = 0x7f;

use crate::error::{Result, RiscvError};
use crate::memory::Memory;
use crate::task::Scheduler;

pub fn futex(scheduler: &mut Scheduler, memory: &mut Memory, cpu: &mut crate::cpu::Cpu, uaddr: u64, op: u32, n_or_expected: u32) -> Result<i64> {
    if uaddr == 0 || uaddr % 4 != 0 {
        return Ok(crate::syscall::errno::EINVAL);
    }
    match op & FUTEX_CMD_MASK {
        FUTEX_WAIT => {
            let mut buf = [0u8; 4];
            memory.read_bytes(uaddr, &mut buf)?;
            let current = u32::from_le_bytes(buf);
            if current != n_or_expected {
                return Ok(crate::syscall::errno::EAGAIN);
            }
            match scheduler.block_current_on(uaddr, cpu) {
                Ok(()) => Ok(0),
                Err(RiscvError::DeadlockReached) => Err(RiscvError::DeadlockReached),
                Err(e) => Err(e),
            }
        }
        FUTEX_WAKE => Ok(scheduler.wake(uaddr, n_or_expected) as i64),
        _ => Ok(crate::syscall::errno::ENOSYS),
    }
}

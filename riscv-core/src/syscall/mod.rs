//! System-call dispatch (spec.md §4.5/§7).
//!
//! Out of scope per spec.md §1 is the full POSIX emulation layer; what
//! lives here is the small bootstrap set (`table.rs`) needed for the
//! end-to-end scenarios in spec.md §8, plus the registration surface
//! (`install_syscall_handler`) an embedder uses to add the rest.

pub mod errno;
pub mod futex;
pub mod table;

use log::{debug, warn};

use crate::error::{Result, RiscvError};
use crate::machine::Machine;
use crate::signal;

/// Dispatch the syscall named by `a7`, reading arguments from `a0..a6`.
/// Called by `Machine::simulate` when a CPU step reports `StepOutcome::Ecall`.
pub fn dispatch(machine: &mut Machine) -> Result<()> {
    let number = machine.cpu.gpr.get(17) as u64; // a7
    let args = [
        machine.cpu.gpr.get(10) as u64, // a0
        machine.cpu.gpr.get(11) as u64, // a1
        machine.cpu.gpr.get(12) as u64, // a2
        machine.cpu.gpr.get(13) as u64, // a3
        machine.cpu.gpr.get(14) as u64, // a4
        machine.cpu.gpr.get(15) as u64, // a5
    ];

    let result = match number {
        table::SYS_EXIT => {
            machine.scheduler.exit_current(&mut machine.cpu)?;
            if machine.scheduler.all_exited() {
                machine.set_result(args[0]);
                machine.stop();
            }
            0
        }
        table::SYS_EXIT_GROUP => {
            machine.set_result(args[0]);
            machine.stop();
            0
        }
        table::SYS_WRITE => sys_write(machine, args[0], args[1], args[2] as usize)?,
        table::SYS_BRK => sys_brk(machine, args[0])? as i64,
        table::SYS_MMAP => sys_mmap(machine, args[1] as usize)? as i64,
        table::SYS_MUNMAP => {
            sys_munmap(machine, args[0], args[1] as usize);
            0
        }
        table::SYS_FUTEX => futex::futex(
            &mut machine.scheduler,
            &mut machine.memory,
            &mut machine.cpu,
            args[0],
            args[1] as u32,
            args[2] as u32,
        )?,
        table::SYS_RT_SIGACTION => {
            machine.signals.set_action(
                args[0] as usize,
                crate::signal::SignalAction { handler: args[1], alt_stack: 0, mask: 0 },
            );
            0
        }
        table::SYS_RT_SIGRETURN => {
            signal::sigreturn(&mut machine.cpu, &mut machine.memory)?;
            0
        }
        table::SYS_CLOCK_GETTIME => {
            // No cycle-accurate timing (spec.md §1's Non-goals); derive a
            // deterministic, monotonically increasing value from the
            // instruction counter instead of touching the host clock.
            let buf = [0i64.to_le_bytes(), (machine.instruction_counter() as i64).to_le_bytes()].concat();
            machine.memory.write_bytes(args[1], &buf)?;
            0
        }
        table::SYS_GETTID => machine.scheduler.current_tid() as i64,
        _ => {
            if let Some(handler) = machine.handlers.get_mut(&number) {
                handler(&mut machine.cpu, &mut machine.memory, &args)?
            } else if let Some(catch_all) = machine.unhandled.as_mut() {
                catch_all(number, &args)?
            } else {
                warn!("unhandled syscall {number}");
                return Err(RiscvError::UnhandledSyscall { number });
            }
        }
    };
    machine.cpu.gpr.set(10, result as i64 as i128 as u128, machine.cpu.xlen);
    Ok(())
}

fn sys_write(machine: &mut Machine, fd: u64, ptr: u64, len: usize) -> Result<i64> {
    if fd != 1 && fd != 2 {
        return Ok(errno::EBADF);
    }
    let fragments = machine.memory.gather_buffers(ptr, len)?;
    for frag in &fragments {
        (machine.printer)(frag);
    }
    debug!("write(fd={fd}, len={len})");
    Ok(len as i64)
}

fn sys_brk(machine: &mut Machine, requested: u64) -> Result<u64> {
    if requested == 0 {
        return Ok(machine.brk_current);
    }
    if requested < machine.heap_address {
        return Ok(machine.brk_current);
    }
    let grow = requested.saturating_sub(machine.brk_current);
    if grow > 0 {
        machine.memory.set_page_attr_range(
            machine.brk_current,
            grow,
            crate::memory::page::PageAttr::READ | crate::memory::page::PageAttr::WRITE,
        )?;
    }
    machine.brk_current = requested;
    Ok(machine.brk_current)
}

fn sys_mmap(machine: &mut Machine, length: usize) -> Result<u64> {
    let addr = machine.mmap_cursor;
    let len = (length as u64).max(1);
    machine.memory.set_page_attr_range(
        addr,
        len,
        crate::memory::page::PageAttr::READ | crate::memory::page::PageAttr::WRITE,
    )?;
    let page_size = crate::memory::page::PAGE_SIZE as u64;
    machine.mmap_cursor += (len + page_size - 1) & !(page_size - 1);
    Ok(addr)
}

fn sys_munmap(machine: &mut Machine, addr: u64, length: usize) {
    let first = crate::memory::page_number(addr);
    let count = (length as u64).div_ceil(crate::memory::page::PAGE_SIZE as u64);
    machine.memory.free_pages(first, count);
}

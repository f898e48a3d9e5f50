//! Signal Table and delivery (spec.md §3/§4.6).
//!
//! Grounded in structure (handler/alt-stack/mask per signal, deliver-then-
//! clear-pending loop) on
//! `examples/ryanbreen-breenix/kernel/src/signal/delivery.rs`, adapted to
//! explicit delivery only (`tgkill`) since this emulator has no async
//! interrupt source of its own.

use log::debug;

use crate::cpu::Cpu;
use crate::error::Result;
use crate::memory::Memory;

pub const NSIG: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct SignalAction {
    /// 0 ⇒ default action (terminate thread).
    pub handler: u64,
    pub alt_stack: u64,
    pub mask: u64,
}

pub struct SignalTable {
    actions: [SignalAction; NSIG],
}

impl SignalTable {
    pub fn new() -> Self {
        SignalTable { actions: [SignalAction::default(); NSIG] }
    }

    pub fn set_action(&mut self, sig: usize, action: SignalAction) {
        if sig < NSIG {
            self.actions[sig] = action;
        }
    }

    pub fn action(&self, sig: usize) -> SignalAction {
        self.actions.get(sig).copied().unwrap_or_default()
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of delivering a signal to a CPU context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No handler installed: the target thread terminates.
    ThreadExits,
    /// Handler jumped to; registers were pushed to the alt-stack (or the
    /// current stack, if none is configured).
    Dispatched,
}

/// Deliver `sig` to `cpu`: push its context to the alt-stack and redirect PC
/// to the handler, or report that the thread should exit when unset.
/// Mirrors `tgkill`'s explicit-delivery semantics from spec.md §4.6.
pub fn deliver(table: &SignalTable, sig: usize, cpu: &mut Cpu, memory: &mut Memory) -> Result<Delivery> {
    let action = table.action(sig);
    if action.handler == 0 {
        debug!("signal {sig} has no handler; thread terminates");
        return Ok(Delivery::ThreadExits);
    }

    let sp = if action.alt_stack != 0 {
        action.alt_stack
    } else {
        cpu.gpr.get(2) as u64 // sp (x2)
    };
    // Push a minimal frame: saved pc then saved sp, so SIGRETURN can restore
    // both without a full ucontext layout.
    let frame_base = sp - 16;
    memory.write_bytes(frame_base, &cpu.pc.to_le_bytes())?;
    memory.write_bytes(frame_base + 8, &(cpu.gpr.get(2) as u64).to_le_bytes())?;

    cpu.gpr.set(2, frame_base as u128, cpu.xlen);
    cpu.gpr.set(1, frame_base as u128, cpu.xlen); // ra -> SIGRETURN finds the frame via sp anyway
    cpu.pc = action.handler;
    debug!("signal {sig} dispatched to handler {:#x}", action.handler);
    Ok(Delivery::Dispatched)
}

/// `SIGRETURN`: pop the frame pushed by `deliver` and resume at the saved pc.
pub fn sigreturn(cpu: &mut Cpu, memory: &mut Memory) -> Result<()> {
    let frame_base = cpu.gpr.get(2) as u64;
    let mut pc_bytes = [0u8; 8];
    let mut sp_bytes = [0u8; 8];
    memory.read_bytes(frame_base, &mut pc_bytes)?;
    memory.read_bytes(frame_base + 8, &mut sp_bytes)?;
    cpu.pc = u64::from_le_bytes(pc_bytes);
    cpu.gpr.set(2, u64::from_le_bytes(sp_bytes) as u128, cpu.xlen);
    Ok(())
}

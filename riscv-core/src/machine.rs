//! The top-level `Machine` aggregate (spec.md §3/§4.5).
//!
//! Owns CPU and Memory by value, resolving the cyclic-ownership design note
//! in spec.md §9 the way the note recommends: `Machine` is the only type
//! that ever borrows `Cpu` and `Memory` simultaneously, and it does so via
//! disjoint field access rather than back-pointers.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::cpu::{Cpu, StepOutcome};
use crate::elf::{self, Demangler, LoadResult, MachineOptions};
use crate::error::{Result, RiscvError};
use crate::memory::Memory;
use crate::signal::SignalTable;
use crate::task::Scheduler;
use crate::xlen::Xlen;

pub type SyscallHandler = Box<dyn FnMut(&mut Cpu, &mut Memory, &[u64]) -> Result<i64> + Send>;
pub type UnhandledSyscallHandler = Box<dyn FnMut(u64, &[u64]) -> Result<i64> + Send>;
pub type Printer = Box<dyn FnMut(&[u8]) + Send>;
pub type StdinHook = Box<dyn FnMut(&mut [u8]) -> usize + Send>;
pub type FaultHandler = Box<dyn FnMut(&mut Cpu, &mut Memory, &RiscvError) -> bool + Send>;

pub struct Machine {
    pub cpu: Cpu,
    pub memory: Memory,
    pub scheduler: Scheduler,
    pub signals: SignalTable,

    pub(crate) handlers: HashMap<u64, SyscallHandler>,
    pub(crate) unhandled: Option<UnhandledSyscallHandler>,
    pub(crate) printer: Printer,
    stdin: StdinHook,
    debug_printer: Printer,
    fault_handler: Option<FaultHandler>,
    userdata: Option<Box<dyn std::any::Any + Send>>,

    instruction_counter: u64,
    max_instructions: u64,
    stop_flag: bool,
    result: u64,

    pub(crate) heap_address: u64,
    pub(crate) brk_current: u64,
    pub(crate) mmap_cursor: u64,
    stack_address: u64,
    exit_address: u64,

    image: Arc<Vec<u8>>,
    symtab: Vec<(String, u64, u64)>,
    demangler: Option<Demangler>,
    minimal_fork: bool,
}

impl Machine {
    pub fn new(binary: Vec<u8>, options: MachineOptions) -> Result<Self> {
        let image = Arc::new(binary);
        let mut memory = Memory::new(options.memory_max);
        let LoadResult { xlen, entry_address, heap_address, mmap_address, stack_address, exit_address, symtab } =
            elf::load(image.clone(), &mut memory, &options)?;
        // Stack pages are left unmapped: they carry default attributes, so
        // Memory's page-fault handler materializes them on first touch
        // (spec.md §4.1's "default-attribute writes to unmapped pages are
        // no-ops" — there's nothing to pre-reserve here).

        let mut cpu = Cpu::new(xlen);
        cpu.align_check = options.align_check;
        cpu.pc = entry_address;
        cpu.gpr.set(2, stack_address as u128, xlen); // sp
        let scheduler = Scheduler::new(entry_address, stack_address);

        info!("machine loaded: xlen={xlen} entry={:#x} heap={:#x}", entry_address, heap_address);

        Ok(Machine {
            cpu,
            memory,
            scheduler,
            signals: SignalTable::new(),
            handlers: HashMap::new(),
            unhandled: None,
            printer: Box::new(|_| {}),
            stdin: Box::new(|_| 0),
            debug_printer: Box::new(|_| {}),
            fault_handler: None,
            userdata: None,
            instruction_counter: 0,
            max_instructions: 0,
            stop_flag: false,
            result: 0,
            heap_address,
            brk_current: heap_address,
            mmap_cursor: mmap_address,
            stack_address,
            exit_address,
            image,
            symtab,
            demangler: None,
            minimal_fork: options.minimal_fork,
        })
    }

    /// Fork construction (spec.md §4.5): the child shares the read-only
    /// area, execute segments, and ELF image with the parent; every
    /// non-`dont_fork` page becomes CoW between the two.
    pub fn fork(&mut self) -> Machine {
        let child_memory = self.memory.fork_share();
        let mut child_cpu = Cpu::new(self.cpu.xlen);
        child_cpu.align_check = self.cpu.align_check;
        child_cpu.gpr = self.cpu.gpr.clone();
        child_cpu.fpr = self.cpu.fpr.clone();
        child_cpu.pc = self.cpu.pc;
        if let Some(seg) = self.cpu.current_segment() {
            child_cpu.bind_segment(seg.clone());
        }

        Machine {
            cpu: child_cpu,
            memory: child_memory,
            scheduler: Scheduler::new(self.cpu.pc, self.stack_address),
            signals: SignalTable::new(),
            handlers: HashMap::new(),
            unhandled: None,
            printer: Box::new(|_| {}),
            stdin: Box::new(|_| 0),
            debug_printer: Box::new(|_| {}),
            fault_handler: None,
            userdata: None,
            instruction_counter: 0,
            max_instructions: self.max_instructions,
            stop_flag: false,
            result: 0,
            heap_address: self.heap_address,
            brk_current: self.brk_current,
            mmap_cursor: self.mmap_cursor,
            stack_address: self.stack_address,
            exit_address: self.exit_address,
            image: self.image.clone(),
            symtab: self.symtab.clone(),
            demangler: None,
            minimal_fork: self.minimal_fork,
        }
    }

    pub fn instruction_counter(&self) -> u64 {
        self.instruction_counter
    }

    pub fn max_instructions(&self) -> u64 {
        self.max_instructions
    }

    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    pub fn set_result(&mut self, value: u64) {
        self.result = value;
    }

    /// The value `set_result` last recorded. Untyped at this layer — the
    /// original's `return_value<T>()` template just reinterprets the same
    /// bits, which a Rust caller does with an `as` cast at the call site.
    pub fn return_value(&self) -> u64 {
        self.result
    }

    pub fn install_syscall_handler(&mut self, number: u64, handler: SyscallHandler) {
        self.handlers.insert(number, handler);
    }

    pub fn on_unhandled_syscall(&mut self, handler: UnhandledSyscallHandler) {
        self.unhandled = Some(handler);
    }

    pub fn set_printer(&mut self, f: Printer) {
        self.printer = f;
    }

    pub fn set_stdin(&mut self, f: StdinHook) {
        self.stdin = f;
    }

    pub fn set_debug_printer(&mut self, f: Printer) {
        self.debug_printer = f;
    }

    pub fn set_fault_handler(&mut self, f: FaultHandler) {
        self.fault_handler = Some(f);
    }

    pub fn set_userdata<T: std::any::Any + Send>(&mut self, data: T) {
        self.userdata = Some(Box::new(data));
    }

    pub fn userdata<T: std::any::Any>(&self) -> Option<&T> {
        self.userdata.as_ref().and_then(|b| b.downcast_ref::<T>())
    }

    pub fn address_of(&self, symbol: &str) -> Option<u64> {
        crate::elf::resolve_symbol(&self.symtab, symbol, self.demangler.as_ref()).map(|(addr, _)| addr)
    }

    pub fn resolve_symbol(&self, symbol: &str) -> Option<(u64, u64)> {
        crate::elf::resolve_symbol(&self.symtab, symbol, self.demangler.as_ref())
    }

    pub fn set_demangler(&mut self, demangler: Demangler) {
        self.demangler = Some(demangler);
    }

    pub fn copy_to_guest(&mut self, addr: u64, src: &[u8]) -> Result<()> {
        self.memory.write_bytes(addr, src)
    }

    pub fn copy_from_guest(&mut self, addr: u64, dst: &mut [u8]) -> Result<()> {
        self.memory.read_bytes(addr, dst)
    }

    pub fn memset(&mut self, addr: u64, value: u8, len: usize) -> Result<()> {
        let buf = vec![value; len];
        self.memory.write_bytes(addr, &buf)
    }

    pub fn gather_buffers(&mut self, addr: u64, len: usize) -> Result<Vec<Vec<u8>>> {
        self.memory.gather_buffers(addr, len)
    }

    /// Run for at most `max` additional instructions. `max == u64::MAX`
    /// means "until stopped" (spec.md §4.5).
    pub fn simulate(&mut self, max: u64) -> Result<()> {
        self.max_instructions = self.instruction_counter.saturating_add(max);
        self.stop_flag = false;
        while !self.stop_flag {
            if self.instruction_counter >= self.max_instructions {
                return Err(RiscvError::Timeout { max });
            }
            let outcome = self.cpu.step(&mut self.memory);
            match outcome {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Ecall) => {
                    if let Err(e) = crate::syscall::dispatch(self) {
                        if !self.offer_to_fault_handler(&e) {
                            return Err(e);
                        }
                    }
                }
                Ok(StepOutcome::Ebreak) => {
                    (self.debug_printer)(format!("ebreak at {:#x}\n", self.cpu.pc).as_bytes());
                }
                Err(e) => {
                    if !self.offer_to_fault_handler(&e) {
                        return Err(e);
                    }
                }
            }
            self.instruction_counter += 1;
        }
        Ok(())
    }

    fn offer_to_fault_handler(&mut self, error: &RiscvError) -> bool {
        if let Some(mut handler) = self.fault_handler.take() {
            let handled = handler(&mut self.cpu, &mut self.memory, error);
            self.fault_handler = Some(handler);
            handled
        } else {
            false
        }
    }

    /// Marshal arguments into a0..a7 (int) / fa0..fa7 (float), push a return
    /// sentinel redirecting RA to the exit trampoline, then `simulate` until
    /// that trampoline is reached (spec.md §4.5).
    pub fn vmcall(&mut self, addr_or_symbol: VmTarget, args: &[GuestArg]) -> Result<u64> {
        let target = match addr_or_symbol {
            VmTarget::Address(a) => a,
            VmTarget::Symbol(name) => {
                self.address_of(name).ok_or(RiscvError::InvalidProgram { reason: "vmcall: unknown symbol" })?
            }
        };

        let mut int_reg = 10u8; // a0
        let mut fp_reg = 10u8; // fa0 (separate register file)
        for arg in args {
            match arg {
                GuestArg::Int(v) => {
                    self.cpu.gpr.set(int_reg, *v as u128, self.cpu.xlen);
                    int_reg += 1;
                }
                GuestArg::Float(v) => {
                    self.cpu.fpr.set(fp_reg, crate::cpu::registers::Fpr::from_f64(*v));
                    fp_reg += 1;
                }
                GuestArg::Bytes(bytes) => {
                    // Aggregates > 2*XLEN go by pointer to guest-copied memory;
                    // the caller is responsible for providing scratch space
                    // via a preceding mmap when needed (documented deviation,
                    // see DESIGN.md).
                    let addr = self.mmap_cursor;
                    self.mmap_cursor += bytes.len() as u64;
                    self.memory.set_page_attr_range(
                        addr,
                        bytes.len() as u64,
                        crate::memory::page::PageAttr::READ | crate::memory::page::PageAttr::WRITE,
                    )?;
                    self.memory.write_bytes(addr, bytes)?;
                    self.cpu.gpr.set(int_reg, addr as u128, self.cpu.xlen);
                    int_reg += 1;
                }
            }
        }

        let sp = self.cpu.gpr.get(2) as u64;
        let new_sp = (sp - 256) & !15u64;
        self.cpu.gpr.set(2, new_sp as u128, self.cpu.xlen);
        self.cpu.gpr.set(1, self.exit_address as u128, self.cpu.xlen); // ra -> trampoline
        self.cpu.pc = target;

        // Run until control returns to the trampoline — reaching its address
        // is the sentinel itself; the `ecall` sitting there never executes.
        while self.cpu.pc != self.exit_address {
            self.max_instructions = self.instruction_counter.saturating_add(10_000_000);
            match self.cpu.step(&mut self.memory) {
                Ok(StepOutcome::Continue) => {}
                Ok(StepOutcome::Ecall) => crate::syscall::dispatch(self)?,
                Ok(StepOutcome::Ebreak) => {}
                Err(e) => {
                    if !self.offer_to_fault_handler(&e) {
                        return Err(e);
                    }
                }
            }
            self.instruction_counter += 1;
        }
        Ok(self.cpu.gpr.get(10) as u64) // a0
    }

    pub fn heap_address(&self) -> u64 {
        self.heap_address
    }

    pub fn stack_address(&self) -> u64 {
        self.stack_address
    }

    pub fn exit_address(&self) -> u64 {
        self.exit_address
    }
}

#[derive(Debug, Clone, Copy)]
pub enum VmTarget<'a> {
    Address(u64),
    Symbol(&'a str),
}

/// An argument to `vmcall`, handling the three shapes spec.md §4.5 names.
#[derive(Debug, Clone)]
pub enum GuestArg {
    Int(i64),
    Float(f64),
    Bytes(Vec<u8>),
}

/// Small helper trait so callers can write `vmcall(addr, &[1i64.into(), ...])`
/// the way the original's templated `vmcall<Args...>` reads.
pub trait IntoGuestArg {
    fn into_guest_arg(self) -> GuestArg;
}

impl IntoGuestArg for i64 {
    fn into_guest_arg(self) -> GuestArg {
        GuestArg::Int(self)
    }
}
impl IntoGuestArg for u64 {
    fn into_guest_arg(self) -> GuestArg {
        GuestArg::Int(self as i64)
    }
}
impl IntoGuestArg for f64 {
    fn into_guest_arg(self) -> GuestArg {
        GuestArg::Float(self)
    }
}
impl IntoGuestArg for f32 {
    fn into_guest_arg(self) -> GuestArg {
        GuestArg::Float(self as f64)
    }
}
impl IntoGuestArg for &str {
    fn into_guest_arg(self) -> GuestArg {
        let mut bytes = self.as_bytes().to_vec();
        bytes.push(0);
        GuestArg::Bytes(bytes)
    }
}

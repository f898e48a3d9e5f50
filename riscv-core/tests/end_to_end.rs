//! End-to-end scenarios exercising the full `Machine` stack (ELF load,
//! decode, CPU execution, syscall dispatch, paged memory, fork, vmcall)
//! against hand-assembled RISC-V images — there is no toolchain available
//! to produce these from source, so the instruction streams are encoded by
//! hand the same way `elf.rs`'s and `multiprocess.rs`'s own unit tests do.

use std::sync::{Arc, Mutex};

use riscv_core::memory::page::{PageAttr, TrapCallback, TrapEvent, TrapMode};
use riscv_core::memory::page_number;
use riscv_core::{GuestArg, Machine, MachineOptions, VmTarget};

const OPCODE_LOAD: u32 = 0b000_0011;
const OPCODE_STORE: u32 = 0b010_0011;
const OPCODE_OP_IMM: u32 = 0b001_0011;
const OPCODE_OP: u32 = 0b011_0011;
const OPCODE_LUI: u32 = 0b011_0111;
const OPCODE_JALR: u32 = 0b110_0111;
const ECALL: u32 = 0x0000_0073;

fn r_type(funct7: u32, rs2: u8, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    (funct7 << 25) | ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | (funct3 << 12) | ((rd as u32) << 7) | opcode
}

fn i_type(imm: i32, rs1: u8, funct3: u32, rd: u8, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | ((rs1 as u32) << 15) | (funct3 << 12) | ((rd as u32) << 7) | opcode
}

fn s_type(imm: i32, rs2: u8, rs1: u8, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32 & 0xFFF;
    let hi = (imm >> 5) & 0x7F;
    let lo = imm & 0x1F;
    (hi << 25) | ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | (funct3 << 12) | (lo << 7) | opcode
}

fn u_type(imm20: u32, rd: u8, opcode: u32) -> u32 {
    (imm20 << 12) | ((rd as u32) << 7) | opcode
}

fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    i_type(imm, rs1, 0b000, rd, OPCODE_OP_IMM)
}
fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    r_type(0b0000000, rs2, rs1, 0b000, rd, OPCODE_OP)
}
fn lui(rd: u8, imm20: u32) -> u32 {
    u_type(imm20, rd, OPCODE_LUI)
}
fn sw(rs2: u8, offset: i32, rs1: u8) -> u32 {
    s_type(offset, rs2, rs1, 0b010, OPCODE_STORE)
}
fn lw(rd: u8, offset: i32, rs1: u8) -> u32 {
    i_type(offset, rs1, 0b010, rd, OPCODE_LOAD)
}
fn jalr(rd: u8, rs1: u8, offset: i32) -> u32 {
    i_type(offset, rs1, 0b000, rd, OPCODE_JALR)
}

const X0: u8 = 0;
const RA: u8 = 1;
const A0: u8 = 10;
const A1: u8 = 11;
const A2: u8 = 12;
const A7: u8 = 17;

/// Same single-PT_LOAD, execute-only-ish layout as `elf.rs`'s own
/// `build_minimal_elf` test helper: one R|X segment holding `code`,
/// starting (and entering) at `entry`.
fn build_elf(entry: u64, code: &[u8]) -> Vec<u8> {
    let mut elf = vec![0u8; 64];
    elf[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    elf[4] = 2; // ELFCLASS64
    elf[5] = 1; // ELFDATA2LSB
    elf[6] = 1;
    elf[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    elf[18..20].copy_from_slice(&243u16.to_le_bytes()); // EM_RISCV
    elf[24..32].copy_from_slice(&entry.to_le_bytes());
    let phoff = 64u64;
    elf[32..40].copy_from_slice(&phoff.to_le_bytes());
    elf[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
    elf[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
    let mut phdr = vec![0u8; 56];
    phdr[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    phdr[4..8].copy_from_slice(&(4u32 | 1u32).to_le_bytes()); // PF_R | PF_X
    let file_off = 64 + 56;
    phdr[8..16].copy_from_slice(&(file_off as u64).to_le_bytes());
    phdr[16..24].copy_from_slice(&entry.to_le_bytes());
    phdr[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
    phdr[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());
    elf.extend_from_slice(&phdr);
    elf.extend_from_slice(code);
    elf
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Scenario: a program that sets a0 and exits through `SYS_EXIT`; the
/// result `Machine::simulate` leaves behind is exactly that literal.
#[test]
fn return_literal() {
    let code = words_to_bytes(&[
        addi(A0, X0, 42),
        addi(A7, X0, 93), // SYS_EXIT
        ECALL,
    ]);
    let elf = build_elf(0x1000, &code);
    let mut machine = Machine::new(elf, MachineOptions::default()).unwrap();
    machine.simulate(1_000).unwrap();
    assert_eq!(machine.return_value(), 42);
}

/// Scenario: `write(1, "hi\n", 3)` followed by `exit(0)`. The string lives
/// right after the code in the same read+execute segment — read-only data
/// embedded in the text segment needs no separate writable page.
#[test]
fn hello_world_via_write() {
    let message = b"hi\n";
    let code_len_words = 9;
    let data_addr = 0x1000u64 + (code_len_words * 4) as u64;
    let hi20 = (data_addr >> 12) as u32;
    let lo12 = (data_addr & 0xFFF) as i32;

    let mut code = words_to_bytes(&[
        lui(A1, hi20),
        addi(A1, A1, lo12),    // a1 = &message
        addi(A0, X0, 1),       // fd = stdout
        addi(A2, X0, message.len() as i32),
        addi(A7, X0, 64),      // SYS_WRITE
        ECALL,
        addi(A0, X0, 0),
        addi(A7, X0, 93),      // SYS_EXIT
        ECALL,
    ]);
    assert_eq!(code.len() / 4, code_len_words);
    code.extend_from_slice(message);

    let elf = build_elf(0x1000, &code);
    let mut machine = Machine::new(elf, MachineOptions::default()).unwrap();

    let captured: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let captured_in_printer = captured.clone();
    machine.set_printer(Box::new(move |bytes| captured_in_printer.lock().unwrap().extend_from_slice(bytes)));

    machine.simulate(1_000).unwrap();
    assert_eq!(machine.return_value(), 0);
    assert_eq!(&*captured.lock().unwrap(), message);
}

/// Scenario: a write trap installed on a data page fires with the stored
/// word as its `value`, and the store itself still lands in memory.
#[test]
fn write_trap_observes_the_stored_value() {
    let data_addr = 0x2000u64;
    let code = words_to_bytes(&[
        lui(A0, (data_addr >> 12) as u32),
        addi(A1, X0, 123),
        sw(A1, 0, A0),
        addi(A0, X0, 0),
        addi(A7, X0, 93), // SYS_EXIT
        ECALL,
    ]);
    let elf = build_elf(0x1000, &code);
    let mut machine = Machine::new(elf, MachineOptions::default()).unwrap();

    let pageno = page_number(data_addr);
    machine.memory.set_page_attr(pageno, PageAttr::READ | PageAttr::WRITE).unwrap();
    let seen: Arc<Mutex<Option<TrapEvent>>> = Arc::new(Mutex::new(None));
    let seen_in_cb = seen.clone();
    let cb: TrapCallback = Arc::new(Mutex::new(move |event: TrapEvent| {
        *seen_in_cb.lock().unwrap() = Some(event);
    }));
    machine.memory.set_trap(pageno, Some(cb)).unwrap();

    machine.simulate(1_000).unwrap();
    assert_eq!(machine.return_value(), 0);

    let event = seen.lock().unwrap().take().expect("write trap should have fired");
    assert_eq!(event.mode, TrapMode::WRITE);
    assert_eq!(event.offset, 0);
    assert_eq!(event.value, 123);

    let mut readback = [0u8; 4];
    machine.copy_from_guest(data_addr, &mut readback).unwrap();
    assert_eq!(u32::from_le_bytes(readback), 123);
}

/// Scenario: a page installed execute-only with a trap stands in for a
/// call — the CPU never decodes real instructions there, it fires the
/// trap and returns control via `ra`, exactly like calling into a host
/// function pointer.
#[test]
fn execute_trap_stands_in_for_a_call() {
    let code = words_to_bytes(&[addi(A0, X0, 0), addi(A7, X0, 93), ECALL]);
    let elf = build_elf(0x1000, &code);
    let mut machine = Machine::new(elf, MachineOptions::default()).unwrap();

    let stub_addr = 0xF000_0000u64;
    let stub_page = page_number(stub_addr);
    machine.memory.install_page(stub_page, riscv_core::memory::page::Page::zeroed(PageAttr::EXEC));

    let seen: Arc<Mutex<Option<TrapEvent>>> = Arc::new(Mutex::new(None));
    let seen_in_cb = seen.clone();
    let cb: TrapCallback = Arc::new(Mutex::new(move |event: TrapEvent| {
        *seen_in_cb.lock().unwrap() = Some(event);
    }));
    machine.memory.set_trap(stub_page, Some(cb)).unwrap();

    let return_addr = 0x2000u64;
    machine.cpu.gpr.set(1, return_addr as u128, machine.cpu.xlen); // ra
    machine.cpu.pc = stub_addr;
    machine.cpu.step(&mut machine.memory).unwrap();

    assert_eq!(machine.cpu.pc, return_addr);
    let event = seen.lock().unwrap().take().expect("exec trap should have fired");
    assert_eq!(event.mode, TrapMode::EXEC);
    assert_eq!(event.offset, 0);
    assert_eq!(event.value, stub_addr as i64);
}

/// Scenario: forking shares memory read-only until either side writes;
/// a write from the child must not be visible to the parent and vice
/// versa (copy-on-write isolation).
#[test]
fn fork_isolates_writes() {
    let code = words_to_bytes(&[addi(A0, X0, 0), addi(A7, X0, 93), ECALL]);
    let elf = build_elf(0x1000, &code);
    let mut parent = Machine::new(elf, MachineOptions::default()).unwrap();

    let addr = 0x3000u64;
    parent.memory.set_page_attr_range(addr, 8, PageAttr::READ | PageAttr::WRITE).unwrap();
    parent.copy_to_guest(addr, &[0xAA; 8]).unwrap();

    let mut child = parent.fork();
    child.copy_to_guest(addr, &[0xBB; 8]).unwrap();

    let mut parent_readback = [0u8; 8];
    parent.copy_from_guest(addr, &mut parent_readback).unwrap();
    assert_eq!(parent_readback, [0xAA; 8]);

    let mut child_readback = [0u8; 8];
    child.copy_from_guest(addr, &mut child_readback).unwrap();
    assert_eq!(child_readback, [0xBB; 8]);
}

/// Scenario: `vmcall` marshals an integer argument into `a0`, redirects
/// `ra` to the exit trampoline, and returns once the guest function
/// returns through it — rerunning should be idempotent since the function
/// is pure and the trampoline is reusable.
#[test]
fn vmcall_marshals_arguments_and_returns_through_the_trampoline() {
    // fn double(a0: i64) -> i64 { a0 + a0 }
    let code = words_to_bytes(&[add(A0, A0, A0), jalr(X0, RA, 0)]);
    let elf = build_elf(0x1000, &code);
    let mut machine = Machine::new(elf, MachineOptions::default()).unwrap();

    for _ in 0..3 {
        let result = machine.vmcall(VmTarget::Address(0x1000), &[GuestArg::Int(21)]).unwrap();
        assert_eq!(result as i64, 42);
    }
}

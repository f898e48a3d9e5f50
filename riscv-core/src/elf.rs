//! ELF32/ELF64 loader (spec.md §4.2).
//!
//! The header/program-header layouts and the "copy into a local buffer
//! before casting" trick for alignment safety are grounded in
//! `examples/ryanbreen-breenix/kernel/src/elf.rs`; the read-only-area
//! serialization and boundary-page fallback are grounded in
//! `examples/original_source/lib/libriscv/memory.cpp`'s `binary_load_ph`.

use std::mem::size_of;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::decode::segment::ExecuteSegment;
use crate::error::{Result, RiscvError};
use crate::memory::page::{Page, PageAttr, PageBody, PAGE_SIZE};
use crate::memory::Memory;
use crate::xlen::Xlen;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;

const PT_LOAD: u32 = 1;
const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// Configuration accepted by the loader, threaded through from
/// `Machine::new` (spec.md §4.2/§6's `MachineOptions`).
#[derive(Debug, Clone)]
pub struct MachineOptions {
    pub memory_max: u64,
    pub stack_size: u64,
    pub load_program: bool,
    pub protect_segments: bool,
    pub allow_write_exec_segment: bool,
    pub enforce_exec_only: bool,
    pub verbose_loader: bool,
    pub minimal_fork: bool,
    /// Raise `INVALID_ALIGNMENT` on misaligned typed loads/stores instead of
    /// permitting them (spec.md §4.1/§6). RISC-V permits unaligned access by
    /// default, so this defaults to off.
    pub align_check: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            memory_max: 64 << 20,
            stack_size: 2 << 20,
            load_program: true,
            protect_segments: true,
            allow_write_exec_segment: false,
            enforce_exec_only: false,
            verbose_loader: false,
            minimal_fork: false,
            align_check: false,
        }
    }
}

const BRK_MAX: u64 = 64 << 20;

/// Computed load-time facts handed back to `Machine::new`.
pub struct LoadResult {
    pub xlen: Xlen,
    pub entry_address: u64,
    pub heap_address: u64,
    pub mmap_address: u64,
    pub stack_address: u64,
    pub exit_address: u64,
    pub symtab: Vec<(String, u64, u64)>,
}

fn u16_at(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}
fn u32_at(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}
fn u64_at(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

struct RawPhdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

/// Parse the ELF header enough to determine class, entry point, and the
/// program-header table location. Returns `(is64, entry, phoff, phentsize,
/// phnum, shoff, shentsize, shnum, shstrndx)`.
#[allow(clippy::type_complexity)]
fn parse_header(data: &[u8]) -> Result<(bool, u64, usize, usize, usize, usize, usize, usize, usize)> {
    if data.len() < 20 || data[0..4] != ELF_MAGIC {
        return Err(RiscvError::InvalidProgram { reason: "bad ELF magic" });
    }
    let class = data[4];
    if class != ELFCLASS32 && class != ELFCLASS64 {
        return Err(RiscvError::InvalidProgram { reason: "unsupported ELF class" });
    }
    if data[5] != ELFDATA2LSB {
        return Err(RiscvError::InvalidProgram { reason: "not little-endian" });
    }
    let is64 = class == ELFCLASS64;
    let hdr_size = if is64 { 64 } else { 52 };
    if data.len() < hdr_size {
        return Err(RiscvError::InvalidProgram { reason: "ELF header truncated" });
    }
    let e_type = u16_at(data, 16);
    let e_machine = u16_at(data, 18);
    if e_type != ET_EXEC {
        return Err(RiscvError::InvalidProgram { reason: "not ET_EXEC" });
    }
    if e_machine != EM_RISCV {
        return Err(RiscvError::InvalidProgram { reason: "not EM_RISCV" });
    }
    let (entry, phoff, shoff, phentsize, phnum, shentsize, shnum, shstrndx);
    if is64 {
        entry = u64_at(data, 24);
        phoff = u64_at(data, 32) as usize;
        shoff = u64_at(data, 40) as usize;
        phentsize = u16_at(data, 54) as usize;
        phnum = u16_at(data, 56) as usize;
        shentsize = u16_at(data, 58) as usize;
        shnum = u16_at(data, 60) as usize;
        shstrndx = u16_at(data, 62) as usize;
    } else {
        entry = u32_at(data, 24) as u64;
        phoff = u32_at(data, 28) as usize;
        shoff = u32_at(data, 32) as usize;
        phentsize = u16_at(data, 42) as usize;
        phnum = u16_at(data, 44) as usize;
        shentsize = u16_at(data, 46) as usize;
        shnum = u16_at(data, 48) as usize;
        shstrndx = u16_at(data, 50) as usize;
    }
    if !(1..=16).contains(&phnum) {
        return Err(RiscvError::InvalidProgram { reason: "program-header count out of [1,16]" });
    }
    Ok((is64, entry, phoff, phentsize, phnum, shoff, shentsize, shnum, shstrndx))
}

fn parse_phdrs(data: &[u8], is64: bool, phoff: usize, phentsize: usize, phnum: usize) -> Result<Vec<RawPhdr>> {
    let mut out = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let base = phoff + i * phentsize;
        let min_size = if is64 { 56 } else { 32 };
        if base + min_size > data.len() {
            return Err(RiscvError::InvalidProgram { reason: "program header out of bounds" });
        }
        let phdr = if is64 {
            RawPhdr {
                p_type: u32_at(data, base),
                p_flags: u32_at(data, base + 4),
                p_offset: u64_at(data, base + 8),
                p_vaddr: u64_at(data, base + 16),
                p_filesz: u64_at(data, base + 32),
                p_memsz: u64_at(data, base + 40),
            }
        } else {
            RawPhdr {
                p_type: u32_at(data, base),
                p_offset: u32_at(data, base + 4) as u64,
                p_vaddr: u32_at(data, base + 8) as u64,
                p_filesz: u32_at(data, base + 16) as u64,
                p_memsz: u32_at(data, base + 20) as u64,
                p_flags: u32_at(data, base + 24),
            }
        };
        out.push(phdr);
    }
    Ok(out)
}

fn end_page(vaddr: u64, memsz: u64) -> u64 {
    let end = vaddr + memsz;
    (end + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Load `data` into `memory`, returning the computed entry/heap/stack
/// addresses. `image` is kept by the caller (Machine) so read-only-area
/// pages can borrow from it for the program's lifetime.
pub fn load(data: Arc<Vec<u8>>, memory: &mut Memory, options: &MachineOptions) -> Result<LoadResult> {
    let (is64, entry, phoff, phentsize, phnum, shoff, shentsize, shnum, shstrndx) = parse_header(&data)?;
    let xlen = if is64 { Xlen::Rv64 } else { Xlen::Rv32 };
    let phdrs = parse_phdrs(&data, is64, phoff, phentsize, phnum)?;

    // Reject overlapping PT_LOADs (spec.md §6).
    let mut loads: Vec<&RawPhdr> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    loads.sort_by_key(|p| p.p_vaddr);
    for w in loads.windows(2) {
        if w[0].p_vaddr + w[0].p_memsz > w[1].p_vaddr {
            return Err(RiscvError::InvalidProgram { reason: "overlapping PT_LOAD segments" });
        }
    }

    let mut max_segment_end = 0u64;
    let mut have_exec_segment = false;

    if options.load_program {
        for ph in &loads {
            if ph.p_offset as usize + ph.p_filesz as usize > data.len() {
                return Err(RiscvError::InvalidProgram { reason: "segment file range out of bounds" });
            }
            let attr = PageAttr::from_elf_flags(ph.p_flags & PF_R != 0, ph.p_flags & PF_W != 0, ph.p_flags & PF_X != 0);

            if options.verbose_loader {
                info!(
                    "loading segment vaddr={:#x} filesz={:#x} memsz={:#x} r={} w={} x={}",
                    ph.p_vaddr,
                    ph.p_filesz,
                    ph.p_memsz,
                    attr.contains(PageAttr::READ),
                    attr.contains(PageAttr::WRITE),
                    attr.contains(PageAttr::EXEC)
                );
            }

            if attr.contains(PageAttr::EXEC) && attr.contains(PageAttr::WRITE) && !options.allow_write_exec_segment {
                return Err(RiscvError::InvalidProgram { reason: "writable executable segment (W^X violation)" });
            }
            if attr.contains(PageAttr::EXEC)
                && (attr.contains(PageAttr::READ) || attr.contains(PageAttr::WRITE))
                && options.enforce_exec_only
            {
                return Err(RiscvError::InvalidProgram { reason: "execute segment must be execute-only" });
            }

            if ph.p_filesz > 0 {
                let src = &data[ph.p_offset as usize..(ph.p_offset + ph.p_filesz) as usize];
                if attr.contains(PageAttr::EXEC) && !have_exec_segment {
                    let bytes: Arc<[u8]> = Arc::from(src.to_vec());
                    let seg = ExecuteSegment::build(ph.p_vaddr, bytes, true);
                    memory.add_segment(Arc::new(seg));
                    have_exec_segment = true;
                    // An R|X segment is readable on real hardware: install its
                    // bytes as pages too, not just the instruction-fetch path
                    // `ExecuteSegment` serves. Otherwise a `write()` of data
                    // embedded in `.text` (a string constant, say) would read
                    // back as the CoW zero page instead of the real bytes.
                    if attr.contains(PageAttr::READ) {
                        if attr.contains(PageAttr::WRITE) {
                            copy_into_pages(memory, ph.p_vaddr, src, attr)?;
                        } else {
                            serialize_readonly(memory, ph.p_vaddr, src, attr, &data, ph.p_offset);
                        }
                    }
                } else if attr.contains(PageAttr::READ) && !attr.contains(PageAttr::WRITE) {
                    serialize_readonly(memory, ph.p_vaddr, src, attr, &data, ph.p_offset);
                } else {
                    copy_into_pages(memory, ph.p_vaddr, src, attr)?;
                }
            }
            if ph.p_memsz > ph.p_filesz {
                // bss: zero-filled, regular writable pages.
                let bss_attr = attr | PageAttr::WRITE;
                let start = ph.p_vaddr + ph.p_filesz;
                let len = ph.p_memsz - ph.p_filesz;
                memory.set_page_attr_range(start, len, bss_attr)?;
            }

            max_segment_end = max_segment_end.max(end_page(ph.p_vaddr, ph.p_memsz));
        }
    }

    let heap_address = max_segment_end;
    let mmap_address = heap_address + BRK_MAX;
    let stack_top = mmap_address + options.stack_size.max(PAGE_SIZE as u64);
    let stack_address = stack_top; // stack grows down from here

    // One-page host-exit trampoline, mapped execute-only just past the stack.
    let exit_address = stack_top + PAGE_SIZE as u64;
    let mut trampoline = [0u8; PAGE_SIZE];
    // `ecall` encoded at offset 0; the CPU's Bc::Ecall path is reached once,
    // and Machine::vmcall recognizes a return to this exact address as "done".
    trampoline[0..4].copy_from_slice(&0x0000_0073u32.to_le_bytes());
    memory.install_page(
        page_no(exit_address),
        Page::new(PageAttr::EXEC | PageAttr::READ, PageBody::from_bytes(trampoline)),
    );
    memory.add_segment(Arc::new(ExecuteSegment::build(exit_address, Arc::from(trampoline.to_vec()), true)));

    let symtab = if shnum > 0 && shstrndx < shnum {
        read_symtab(&data, is64, shoff, shentsize, shnum).unwrap_or_default()
    } else {
        Vec::new()
    };

    if options.protect_segments {
        debug!("segment protection enforced for this load");
    }

    Ok(LoadResult {
        xlen,
        entry_address: entry,
        heap_address,
        mmap_address,
        stack_address,
        exit_address,
        symtab,
    })
}

fn page_no(addr: u64) -> u64 {
    addr >> crate::memory::page::PAGE_SHIFT
}

impl PageAttr {
    fn from_elf_flags(r: bool, w: bool, x: bool) -> Self {
        let mut attr = PageAttr::CACHEABLE;
        if r {
            attr |= PageAttr::READ;
        }
        if w {
            attr |= PageAttr::WRITE;
        }
        if x {
            attr |= PageAttr::EXEC;
        }
        attr
    }
}

fn copy_into_pages(memory: &mut Memory, vaddr: u64, src: &[u8], attr: PageAttr) -> Result<()> {
    memory.set_page_attr_range(vaddr, src.len() as u64, attr | PageAttr::WRITE)?;
    memory.write_bytes(vaddr, src)?;
    if !attr.contains(PageAttr::WRITE) {
        memory.set_page_attr_range(vaddr, src.len() as u64, attr)?;
    }
    Ok(())
}

/// Serialize a read-only, non-writable segment as a contiguous area that
/// points directly into the ELF image: boundary pages (partial first/last
/// page) are owned copies, interior full pages borrow the image directly.
/// Falls back to `copy_into_pages` when the segment is under two pages.
fn serialize_readonly(memory: &mut Memory, vaddr: u64, src: &[u8], attr: PageAttr, image: &[u8], file_offset: u64) {
    if src.len() < 2 * PAGE_SIZE {
        let _ = copy_into_pages(memory, vaddr, src, attr);
        return;
    }
    let base_pageno = page_no(vaddr);
    let page_count = (src.len() as u64).div_ceil(PAGE_SIZE as u64);
    let mut pages = Vec::with_capacity(page_count as usize);
    for i in 0..page_count {
        let mut buf = [0u8; PAGE_SIZE];
        let start = (file_offset + i * PAGE_SIZE as u64) as usize;
        let take = src.len().saturating_sub((i * PAGE_SIZE as u64) as usize).min(PAGE_SIZE);
        if take > 0 && start + take <= image.len() {
            buf[..take].copy_from_slice(&image[start..start + take]);
        }
        pages.push(Arc::new(buf));
    }
    memory.install_readonly_area(base_pageno, pages);
}

/// Read `.symtab`/`.strtab` for `resolve_symbol`/`lookup_by_address`.
fn read_symtab(data: &[u8], is64: bool, shoff: usize, shentsize: usize, shnum: usize) -> Option<Vec<(String, u64, u64)>> {
    const SHT_SYMTAB: u32 = 2;
    let entsize = if is64 { size_of::<u64>() } else { size_of::<u32>() };
    let mut symtab_off = None;
    let mut symtab_size = 0usize;
    let mut link = 0usize;
    for i in 0..shnum {
        let base = shoff + i * shentsize;
        if base + 40 > data.len() {
            return None;
        }
        let sh_type = u32_at(data, base + 4);
        if sh_type == SHT_SYMTAB {
            if is64 {
                symtab_off = Some(u64_at(data, base + 24) as usize);
                symtab_size = u64_at(data, base + 32) as usize;
                link = u32_at(data, base + 40) as usize;
            } else {
                symtab_off = Some(u32_at(data, base + 16) as usize);
                symtab_size = u32_at(data, base + 20) as usize;
                link = u32_at(data, base + 24) as usize;
            }
            break;
        }
    }
    let symtab_off = symtab_off?;
    let strtab_base = shoff + link * shentsize;
    let strtab_off = if is64 {
        u64_at(data, strtab_base + 24) as usize
    } else {
        u32_at(data, strtab_base + 16) as usize
    };

    let sym_size = if is64 { 24 } else { 16 };
    let count = symtab_size / sym_size;
    let mut out = Vec::new();
    for i in 0..count {
        let base = symtab_off + i * sym_size;
        let (name_off, value, size) = if is64 {
            (u32_at(data, base) as usize, u64_at(data, base + 8), u64_at(data, base + 16))
        } else {
            (u32_at(data, base) as usize, u32_at(data, base + 4) as u64, u32_at(data, base + 8) as u64)
        };
        if name_off == 0 {
            continue;
        }
        let name_start = strtab_off + name_off;
        let name_end = data[name_start..].iter().position(|&b| b == 0)? + name_start;
        let name = String::from_utf8_lossy(&data[name_start..name_end]).into_owned();
        out.push((name, value, size));
    }
    let _ = entsize;
    Some(out)
}

/// Pluggable symbol demangler. Defaults to identity; embedders may install
/// something like `rustc-demangle` or the C++ Itanium demangler.
pub type Demangler = Box<dyn Fn(&str) -> String + Send + Sync>;

pub fn resolve_symbol(symtab: &[(String, u64, u64)], name: &str, demangler: Option<&Demangler>) -> Option<(u64, u64)> {
    symtab.iter().find_map(|(n, addr, size)| {
        let display = demangler.map(|d| d(n)).unwrap_or_else(|| n.clone());
        (display == name || n == name).then_some((*addr, *size))
    })
}

pub fn lookup_by_address(symtab: &[(String, u64, u64)], addr: u64) -> Option<&(String, u64, u64)> {
    symtab
        .iter()
        .find(|(_, v, size)| addr >= *v && addr < *v + *size)
        .or_else(|| symtab.iter().filter(|(_, v, _)| *v <= addr).max_by_key(|(_, v, _)| *v))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_minimal_elf(entry: u64, code: &[u8]) -> Vec<u8> {
        let mut elf = vec![0u8; 64];
        elf[0..4].copy_from_slice(&ELF_MAGIC);
        elf[4] = ELFCLASS64;
        elf[5] = ELFDATA2LSB;
        elf[6] = 1;
        elf[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        elf[18..20].copy_from_slice(&EM_RISCV.to_le_bytes());
        elf[24..32].copy_from_slice(&entry.to_le_bytes());
        let phoff = 64u64;
        elf[32..40].copy_from_slice(&phoff.to_le_bytes());
        elf[54..56].copy_from_slice(&56u16.to_le_bytes()); // phentsize
        elf[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
        let mut phdr = vec![0u8; 56];
        phdr[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        phdr[4..8].copy_from_slice(&(PF_R | PF_X).to_le_bytes());
        let file_off = 64 + 56;
        phdr[8..16].copy_from_slice(&(file_off as u64).to_le_bytes());
        phdr[16..24].copy_from_slice(&entry.to_le_bytes());
        phdr[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
        phdr[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());
        elf.extend_from_slice(&phdr);
        elf.extend_from_slice(code);
        elf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut mem = Memory::new(1 << 20);
        let data = Arc::new(vec![0u8; 64]);
        let err = load(data, &mut mem, &MachineOptions::default()).unwrap_err();
        assert!(matches!(err, RiscvError::InvalidProgram { .. }));
    }

    #[test]
    fn loads_minimal_executable_segment() {
        let code = 0x0000_0073u32.to_le_bytes(); // ecall
        let data = Arc::new(build_minimal_elf(0x1000, &code));
        let mut mem = Memory::new(1 << 20);
        let result = load(data, &mut mem, &MachineOptions::default()).unwrap();
        assert_eq!(result.entry_address, 0x1000);
        assert!(mem.find_segment(0x1000).is_some());
    }
}

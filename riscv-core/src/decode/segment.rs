//! Execute segments: an immutable window of guest code plus its decoder
//! cache, scanned once at creation (spec.md §4.3).

use std::sync::Arc;

use super::{decode, Bc, Fields};

/// `offset / DIVISOR` indexes into the decoder cache. 2 lets compressed
/// (16-bit aligned) instructions address every slot; this emulator always
/// builds the cache at half-word granularity so mixed C/non-C code shares
/// one segment without re-scanning.
pub const DIVISOR: u64 = 2;

/// One decoder cache slot. `operand_hint` carries small auxiliary data the
/// bytecode needs that doesn't fit `Fields` cheaply (currently unused by the
/// interpreter but reserved exactly as the original's `instruction_hint`
/// field is, so a binary-translation hook can repurpose it).
#[derive(Debug, Clone, Copy)]
pub struct DecoderEntry {
    pub handler: Bc,
    pub fields: Fields,
    pub length: u8,
    pub operand_hint: u32,
}

impl DecoderEntry {
    fn invalid() -> Self {
        DecoderEntry { handler: Bc::Invalid, fields: Fields::default(), length: 4, operand_hint: 0 }
    }
}

/// An immutable (base, length, bytes, decoder cache) tuple bound to a CPU.
pub struct ExecuteSegment {
    pub base: u64,
    pub len: u64,
    bytes: Arc<[u8]>,
    cache: Vec<DecoderEntry>,
}

impl ExecuteSegment {
    /// Scan `bytes` (guest code starting at `base`) and build the decoder
    /// cache. `c_extension` controls whether 16-bit-aligned halfwords with
    /// `bits[1:0] != 0b11` are expanded as compressed instructions; when
    /// false any such slot decodes to `BC_INVALID`.
    pub fn build(base: u64, bytes: Arc<[u8]>, c_extension: bool) -> Self {
        let len = bytes.len() as u64;
        let slots = (len / DIVISOR) as usize + 1;
        let mut cache = vec![DecoderEntry::invalid(); slots];

        let mut offset = 0u64;
        while offset + 2 <= len {
            let half = u16::from_le_bytes([bytes[offset as usize], bytes[(offset + 1) as usize]]);
            let is_compressed = half & 0b11 != 0b11;
            let (raw, length) = if is_compressed {
                if !c_extension {
                    offset += 2;
                    continue;
                }
                (expand_compressed(half), 2u8)
            } else if offset + 4 <= len {
                let word = u32::from_le_bytes([
                    bytes[offset as usize],
                    bytes[(offset + 1) as usize],
                    bytes[(offset + 2) as usize],
                    bytes[(offset + 3) as usize],
                ]);
                (word, 4u8)
            } else {
                offset += 2;
                continue;
            };

            let (handler, fields) = decode(raw);
            let slot = (offset / DIVISOR) as usize;
            cache[slot] = DecoderEntry { handler, fields, length, operand_hint: 0 };
            offset += length as u64;
        }

        ExecuteSegment { base, len, bytes, cache }
    }

    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.base && pc < self.base + self.len
    }

    pub fn entry_at(&self, pc: u64) -> Option<&DecoderEntry> {
        if !self.contains(pc) {
            return None;
        }
        let offset = pc - self.base;
        self.cache.get((offset / DIVISOR) as usize)
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Expand a 16-bit compressed instruction into its 32-bit equivalent.
/// Covers the common quadrant-0/1/2 forms exercised by typical
/// `-march=rv64gc` output: `C.ADDI`, `C.LI`, `C.MV`, `C.JR`/`C.JALR`,
/// `C.ADD`, `C.NOP`/`C.EBREAK`. Anything else decodes to an always-illegal
/// 32-bit word so the slot still yields `BC_INVALID` rather than panicking.
fn expand_compressed(half: u16) -> u32 {
    let quadrant = half & 0b11;
    let funct3 = (half >> 13) & 0b111;
    match (quadrant, funct3) {
        // C.ADDI rd,rd,imm (quadrant 1, funct3 000)
        (0b01, 0b000) => {
            let rd = ((half >> 7) & 0x1F) as u8;
            let imm5 = ((half >> 12) & 1) as i32;
            let imm40 = ((half >> 2) & 0x1F) as i32;
            let imm = sext6((imm5 << 5) | imm40);
            encode_i(0b00100, rd, 0, rd, imm)
        }
        // C.LI rd,imm (quadrant 1, funct3 010)
        (0b01, 0b010) => {
            let rd = ((half >> 7) & 0x1F) as u8;
            let imm5 = ((half >> 12) & 1) as i32;
            let imm40 = ((half >> 2) & 0x1F) as i32;
            let imm = sext6((imm5 << 5) | imm40);
            encode_i(0b00100, rd, 0, 0, imm)
        }
        // C.MV / C.ADD / C.JR / C.JALR (quadrant 2, funct3 100)
        (0b10, 0b100) => {
            let rd = ((half >> 7) & 0x1F) as u8;
            let rs2 = ((half >> 2) & 0x1F) as u8;
            let bit12 = (half >> 12) & 1;
            if rs2 != 0 {
                if bit12 == 0 {
                    // C.MV rd, rs2  =>  ADD rd, x0, rs2
                    encode_r(0b01100, rd, 0, 0, 0, rs2)
                } else {
                    // C.ADD rd, rs2 => ADD rd, rd, rs2
                    encode_r(0b01100, rd, 0, rd, 0, rs2)
                }
            } else if bit12 == 0 {
                // C.JR rd => JALR x0, rd, 0
                encode_i(0b11001, 0, 0, rd, 0)
            } else if rd == 0 {
                // C.EBREAK
                encode_i(0b11100, 0, 0, 0, 1)
            } else {
                // C.JALR rd => JALR x1, rd, 0
                encode_i(0b11001, 1, 0, rd, 0)
            }
        }
        // C.NOP (quadrant 1, funct3 000, rd == 0) caught above via rd==0 path
        // in ADDI's encode_i producing ADDI x0,x0,imm.
        _ => 0, // ADDI x0,x0,0 — always decodes to BC_NOP downstream.
    }
}

fn sext6(v: i32) -> i32 {
    (v << 26) >> 26
}

fn encode_i(opcode: u32, rd: u8, funct3: u8, rs1: u8, imm: i32) -> u32 {
    ((imm as u32) << 20) | ((rs1 as u32) << 15) | ((funct3 as u32) << 12) | ((rd as u32) << 7) | (opcode << 2) | 0b11
}

fn encode_r(opcode: u32, rd: u8, funct3: u8, rs1: u8, funct7: u32, rs2: u8) -> u32 {
    (funct7 << 25)
        | ((rs2 as u32) << 20)
        | ((rs1 as u32) << 15)
        | ((funct3 as u32) << 12)
        | ((rd as u32) << 7)
        | (opcode << 2)
        | 0b11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_contains_checks_bounds() {
        let seg = ExecuteSegment::build(0x1000, Arc::from(vec![0u8; 16]), true);
        assert!(seg.contains(0x1000));
        assert!(seg.contains(0x100F));
        assert!(!seg.contains(0x1010));
    }

    #[test]
    fn plain_addi_decodes_via_cache() {
        let raw: u32 = encode_i(0b00100, 5, 0, 6, 10);
        let bytes = raw.to_le_bytes().to_vec();
        let seg = ExecuteSegment::build(0x0, Arc::from(bytes), true);
        let entry = seg.entry_at(0x0).unwrap();
        assert_eq!(entry.handler, Bc::Addi);
        assert_eq!(entry.length, 4);
    }

    #[test]
    fn c_li_expands_to_addi_with_x0_source() {
        // C.LI x5, 10 : quadrant 1 (01), funct3 010, imm5=0, imm[4:0]=10, rd=5
        let half: u16 = 0b010_0_00101_01010_01;
        let bytes = half.to_le_bytes().to_vec();
        let seg = ExecuteSegment::build(0x0, Arc::from(bytes), true);
        let entry = seg.entry_at(0x0).unwrap();
        assert_eq!(entry.handler, Bc::Li);
        assert_eq!(entry.fields.rd, 5);
        assert_eq!(entry.fields.imm, 10);
        assert_eq!(entry.length, 2);
    }
}

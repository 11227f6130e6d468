//! Capstone-based ARM64 instruction decoder.

use capstone::prelude::*;
use capstone::Capstone;

use crate::{Address, AnalyzerError, Decoder, Instruction, INSTRUCTION_SIZE};

/// ARM64 decoder backed by a Capstone handle.
///
/// Capstone supplies the mnemonic and operand text; branch classification
/// and target recovery are done on the raw instruction word so the
/// PC-relative immediates are sign-extended with explicit 64-bit arithmetic.
pub struct CapstoneDecoder {
    cs: Capstone,
}

impl CapstoneDecoder {
    /// Build an ARM64 little-endian decoder.
    pub fn new() -> Result<Self, AnalyzerError> {
        let cs = Capstone::new()
            .arm64()
            .mode(capstone::arch::arm64::ArchMode::Arm)
            .detail(false)
            .build()
            .map_err(|e| AnalyzerError::Format(format!("capstone init failed: {}", e)))?;
        Ok(CapstoneDecoder { cs })
    }

    /// Disassemble up to `count` instructions starting at `address`,
    /// stopping early at the first undecodable word.
    pub fn disassemble_at(&self, code: &[u8], address: Address, count: usize) -> Vec<Instruction> {
        let mut result = Vec::with_capacity(count);
        let mut offset = 0usize;

        while result.len() < count && offset + INSTRUCTION_SIZE <= code.len() {
            match self.decode(&code[offset..], address + offset as Address) {
                Some(insn) => {
                    offset += insn.bytes.len();
                    result.push(insn);
                }
                None => break,
            }
        }

        result
    }
}

impl Decoder for CapstoneDecoder {
    fn decode(&self, code: &[u8], address: Address) -> Option<Instruction> {
        if code.len() < INSTRUCTION_SIZE {
            return None;
        }

        let word_bytes = &code[..INSTRUCTION_SIZE];
        let insns = self.cs.disasm_count(word_bytes, address, 1).ok()?;
        let i = insns.iter().next()?;
        if i.address() != address {
            return None;
        }

        let mnemonic = i.mnemonic().unwrap_or("").to_string();
        let operands = i.op_str().unwrap_or("").to_string();
        let word = u32::from_le_bytes([word_bytes[0], word_bytes[1], word_bytes[2], word_bytes[3]]);

        let is_call = matches!(mnemonic.as_str(), "bl" | "blr");
        let is_return = mnemonic == "ret";
        let is_branch = !is_call
            && (matches!(mnemonic.as_str(), "b" | "br" | "cbz" | "cbnz" | "tbz" | "tbnz")
                || mnemonic.starts_with("b."));
        let is_load = mnemonic.starts_with("ld");
        let is_store = mnemonic.starts_with("st");

        let branch_target = if is_call || is_branch {
            branch_target(word, address)
        } else {
            0
        };

        Some(Instruction {
            address,
            bytes: i.bytes().to_vec(),
            mnemonic,
            operands,
            is_branch,
            is_call,
            is_return,
            is_load,
            is_store,
            branch_target,
        })
    }
}

/// Absolute target of a PC-relative immediate branch, or 0 for register
/// branches and non-branches.
///
/// Immediates are sign-extended from their encoded width to 64 bits before
/// the left shift, never through 32-bit intermediates.
pub fn branch_target(word: u32, address: Address) -> Address {
    // B (000101) / BL (100101): imm26 at bits [25:0]
    if word & 0x7C00_0000 == 0x1400_0000 {
        let imm26 = (word & 0x03FF_FFFF) as i64;
        let offset = (imm26 << 38 >> 38) * 4;
        return (address as i64 + offset) as Address;
    }

    // B.cond: 0101010x with bit 4 clear, imm19 at bits [23:5]
    if word & 0xFF00_0010 == 0x5400_0000 {
        return imm19_target(word, address);
    }

    // CBZ/CBNZ: x011010x, imm19 at bits [23:5]
    if word & 0x7E00_0000 == 0x3400_0000 {
        return imm19_target(word, address);
    }

    // TBZ/TBNZ: x011011x, imm14 at bits [18:5]
    if word & 0x7E00_0000 == 0x3600_0000 {
        let imm14 = ((word >> 5) & 0x3FFF) as i64;
        let offset = (imm14 << 50 >> 50) * 4;
        return (address as i64 + offset) as Address;
    }

    0
}

fn imm19_target(word: u32, address: Address) -> Address {
    let imm19 = ((word >> 5) & 0x7_FFFF) as i64;
    let offset = (imm19 << 45 >> 45) * 4;
    (address as i64 + offset) as Address
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(ws: &[u32]) -> Vec<u8> {
        ws.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn decodes_ret() {
        let decoder = CapstoneDecoder::new().unwrap();
        let insn = decoder.decode(&words(&[0xD65F03C0]), 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "ret");
        assert!(insn.is_return);
        assert!(!insn.is_branch);
        assert!(!insn.is_call);
        assert_eq!(insn.branch_target, 0);
    }

    #[test]
    fn decodes_bl_with_target() {
        let decoder = CapstoneDecoder::new().unwrap();
        // BL +8
        let insn = decoder.decode(&words(&[0x94000002]), 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "bl");
        assert!(insn.is_call);
        assert!(!insn.is_branch);
        assert_eq!(insn.branch_target, 0x1008);
    }

    #[test]
    fn decodes_backward_branch() {
        let decoder = CapstoneDecoder::new().unwrap();
        // B -4: imm26 = -1
        let insn = decoder.decode(&words(&[0x17FFFFFF]), 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "b");
        assert!(insn.is_branch);
        assert_eq!(insn.branch_target, 0xFFC);
    }

    #[test]
    fn decodes_conditional_branch() {
        let decoder = CapstoneDecoder::new().unwrap();
        // B.NE +8: imm19 = 2, cond = 0b0001
        let insn = decoder.decode(&words(&[0x54000041]), 0x1000).unwrap();
        assert!(insn.mnemonic.starts_with("b."));
        assert!(insn.is_branch);
        assert_eq!(insn.branch_target, 0x1008);
    }

    #[test]
    fn decodes_cbz_target() {
        let decoder = CapstoneDecoder::new().unwrap();
        // CBZ x0, +16: imm19 = 4
        let insn = decoder.decode(&words(&[0xB4000080]), 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "cbz");
        assert!(insn.is_branch);
        assert_eq!(insn.branch_target, 0x1010);
    }

    #[test]
    fn classifies_loads_and_stores() {
        let decoder = CapstoneDecoder::new().unwrap();
        // LDR x0, [sp]
        let ldr = decoder.decode(&words(&[0xF94003E0]), 0).unwrap();
        assert!(ldr.is_load);
        assert!(!ldr.is_store);
        // STP x29, x30, [sp, #-0x10]!
        let stp = decoder.decode(&words(&[0xA9BF7BFD]), 0).unwrap();
        assert!(stp.is_store);
        assert!(!stp.is_load);
    }

    #[test]
    fn register_branch_has_no_target() {
        let decoder = CapstoneDecoder::new().unwrap();
        // BR x8
        let insn = decoder.decode(&words(&[0xD61F0100]), 0x1000).unwrap();
        assert_eq!(insn.mnemonic, "br");
        assert!(insn.is_branch);
        assert_eq!(insn.branch_target, 0);
    }

    #[test]
    fn sweep_stops_at_return() {
        let decoder = CapstoneDecoder::new().unwrap();
        let code = words(&[0xA9BF7BFD, 0xD65F03C0, 0xD503201F]);
        let insns = decoder.disassemble_function(&code, 0x1000);
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].address, 0x1000);
        assert_eq!(insns[1].address, 0x1004);
        assert!(insns[1].is_return);
    }

    #[test]
    fn sweep_is_bounded_by_code_length() {
        let decoder = CapstoneDecoder::new().unwrap();
        // No return; the sweep must stop at the end of the buffer.
        let code = words(&[0xD503201F, 0xD503201F]);
        let insns = decoder.disassemble_function(&code, 0);
        assert_eq!(insns.len(), 2);
    }

    #[test]
    fn disassemble_at_respects_count() {
        let decoder = CapstoneDecoder::new().unwrap();
        let code = words(&[0xD503201F, 0xD503201F, 0xD503201F]);
        let insns = decoder.disassemble_at(&code, 0, 2);
        assert_eq!(insns.len(), 2);
    }

    #[test]
    fn raw_target_math_is_64_bit() {
        // The most negative imm26 from a high base must not truncate
        // through 32 bits.
        let word = 0x94000000 | 0x02000000; // BL, imm26 = -0x2000000
        let target = branch_target(word, 0x71_0000_0000);
        assert_eq!(target, 0x71_0000_0000u64 - 0x800_0000);
    }
}

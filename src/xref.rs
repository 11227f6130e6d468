//! Cross-reference extraction and indexing.
//!
//! Two passes: a parallel per-function pass collecting call and jump edges
//! from already-decoded instructions, then a sequential pass that pairs each
//! ADRP with its following instruction (which needs memory reads) to recover
//! 64-bit data pointers. Reverse indices are built only after both passes so
//! index positions match the final vector.

use std::collections::{HashMap, HashSet};
use std::fmt;

use rayon::prelude::*;

use crate::functions::FunctionFinder;
use crate::loader::NsoImage;
use crate::Address;

/// Worker count for the per-function pass.
const NUM_WORKERS: usize = 32;

/// Categories of cross-reference, by producing instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XRefType {
    Call,
    Jump,
    DataRead,
    DataWrite,
    AddressLoad,
    Unknown,
}

impl XRefType {
    pub fn as_u8(self) -> u8 {
        match self {
            XRefType::Call => 0,
            XRefType::Jump => 1,
            XRefType::DataRead => 2,
            XRefType::DataWrite => 3,
            XRefType::AddressLoad => 4,
            XRefType::Unknown => 5,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => XRefType::Call,
            1 => XRefType::Jump,
            2 => XRefType::DataRead,
            3 => XRefType::DataWrite,
            4 => XRefType::AddressLoad,
            _ => XRefType::Unknown,
        }
    }
}

impl fmt::Display for XRefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XRefType::Call => write!(f, "call"),
            XRefType::Jump => write!(f, "jump"),
            XRefType::DataRead => write!(f, "data read"),
            XRefType::DataWrite => write!(f, "data write"),
            XRefType::AddressLoad => write!(f, "address load"),
            XRefType::Unknown => write!(f, "unknown"),
        }
    }
}

/// One directed reference between addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XRef {
    pub from_address: Address,
    pub to_address: Address,
    pub kind: XRefType,
    pub description: String,
    /// Entry address of the enclosing function
    pub from_function: Address,
    pub from_function_name: String,
}

/// Builds and owns the cross-reference list plus both reverse indices.
#[derive(Debug, Default)]
pub struct XRefAnalyzer {
    xrefs: Vec<XRef>,
    refs_to: HashMap<Address, Vec<usize>>,
    refs_from: HashMap<Address, Vec<usize>>,
}

impl XRefAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild all cross-references from the function table.
    pub fn analyze(&mut self, image: &NsoImage, finder: &FunctionFinder) {
        self.xrefs.clear();
        self.refs_to.clear();
        self.refs_from.clear();

        let func_addrs: Vec<Address> = finder.functions().keys().copied().collect();

        // Per-function pass: partitioned across workers, each with its own
        // output vector, concatenated in function-address order.
        let chunk_size = (func_addrs.len() / NUM_WORKERS + 1).max(1);
        let worker_results: Vec<Vec<XRef>> = func_addrs
            .par_chunks(chunk_size)
            .map(|chunk| {
                let mut out = Vec::new();
                for addr in chunk {
                    let func = match finder.function_at(*addr) {
                        Some(f) => f,
                        None => continue,
                    };
                    for insn in &func.instructions {
                        if insn.is_call && insn.branch_target != 0 {
                            out.push(XRef {
                                from_address: insn.address,
                                to_address: insn.branch_target,
                                kind: XRefType::Call,
                                description: "function call".into(),
                                from_function: func.address,
                                from_function_name: func.name.clone(),
                            });
                        } else if insn.is_branch && insn.branch_target != 0 {
                            out.push(XRef {
                                from_address: insn.address,
                                to_address: insn.branch_target,
                                kind: XRefType::Jump,
                                description: "branch".into(),
                                from_function: func.address,
                                from_function_name: func.name.clone(),
                            });
                        }
                    }
                }
                out
            })
            .collect();

        for result in worker_results {
            self.xrefs.extend(result);
        }

        // ADRP pass: needs paired-word memory reads, so it runs sequentially
        // after the parallel pass. Overlapping functions can contain the
        // same ADRP; each site is analyzed once.
        let mut seen = HashSet::new();
        for func in finder.functions().values() {
            for insn in &func.instructions {
                if insn.mnemonic == "adrp" && seen.insert(insn.address) {
                    self.analyze_adrp_sequence(insn.address, image, finder);
                }
            }
        }

        self.build_indices();

        log::debug!("xref analysis found {} references", self.xrefs.len());
    }

    /// Pair an ADRP with the following ADD/LDR to recover the full pointer.
    fn analyze_adrp_sequence(
        &mut self,
        address: Address,
        image: &NsoImage,
        finder: &FunctionFinder,
    ) {
        // Both words must be readable; at the end of text there is no pair.
        let code = match image.read_memory(address, 8) {
            Ok(c) => c,
            Err(_) => return,
        };
        let adrp = u32::from_le_bytes([code[0], code[1], code[2], code[3]]);
        let next = u32::from_le_bytes([code[4], code[5], code[6], code[7]]);

        if adrp & 0x9F00_0000 != 0x9000_0000 {
            return;
        }

        let rd = adrp & 0x1F;
        let page = adrp_page(adrp, address);

        let (target, kind) = if next & 0xFF80_0000 == 0x9100_0000 {
            // ADD Xd, Xn, #imm12
            let rn = (next >> 5) & 0x1F;
            if rn != rd {
                return;
            }
            let imm12 = (next >> 10) & 0xFFF;
            (page + imm12 as u64, XRefType::AddressLoad)
        } else if next & 0xFFC0_0000 == 0xF940_0000 {
            // LDR Xd, [Xn, #imm12] (scaled by 8)
            let rn = (next >> 5) & 0x1F;
            if rn != rd {
                return;
            }
            let imm12 = ((next >> 10) & 0xFFF) * 8;
            (page + imm12 as u64, XRefType::DataRead)
        } else if next & 0xFFC0_0000 == 0xB940_0000 {
            // LDR Wd, [Xn, #imm12] (scaled by 4)
            let rn = (next >> 5) & 0x1F;
            if rn != rd {
                return;
            }
            let imm12 = ((next >> 10) & 0xFFF) * 4;
            (page + imm12 as u64, XRefType::DataRead)
        } else {
            return;
        };

        // Targets outside every segment are dropped.
        if image.segment_at(target).is_none() {
            return;
        }

        let (from_function, from_function_name) = match finder.function_containing(address) {
            Some(f) => (f.address, f.name.clone()),
            None => (0, String::from("unknown")),
        };

        self.xrefs.push(XRef {
            from_address: address,
            to_address: target,
            kind,
            description: kind.to_string(),
            from_function,
            from_function_name,
        });
    }

    fn build_indices(&mut self) {
        for (i, xref) in self.xrefs.iter().enumerate() {
            self.refs_to.entry(xref.to_address).or_default().push(i);
            self.refs_from.entry(xref.from_address).or_default().push(i);
        }
    }

    /// Replace the list wholesale (snapshot load) and rebuild indices.
    pub fn replace(&mut self, xrefs: Vec<XRef>) {
        self.xrefs = xrefs;
        self.refs_to.clear();
        self.refs_from.clear();
        self.build_indices();
    }

    pub fn clear(&mut self) {
        self.xrefs.clear();
        self.refs_to.clear();
        self.refs_from.clear();
    }

    pub fn xrefs(&self) -> &[XRef] {
        &self.xrefs
    }

    pub fn len(&self) -> usize {
        self.xrefs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xrefs.is_empty()
    }

    /// References pointing at `address`, in discovery order.
    pub fn refs_to(&self, address: Address) -> Vec<XRef> {
        self.collect(&self.refs_to, address)
    }

    /// References originating at `address`, in discovery order.
    pub fn refs_from(&self, address: Address) -> Vec<XRef> {
        self.collect(&self.refs_from, address)
    }

    fn collect(&self, index: &HashMap<Address, Vec<usize>>, address: Address) -> Vec<XRef> {
        index
            .get(&address)
            .map(|indices| indices.iter().map(|&i| self.xrefs[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Call references targeting a function entry.
    pub fn calls_to(&self, func_address: Address) -> Vec<XRef> {
        self.xrefs
            .iter()
            .filter(|x| x.to_address == func_address && x.kind == XRefType::Call)
            .cloned()
            .collect()
    }

    /// Call references made from within a function.
    pub fn calls_from(&self, func_address: Address) -> Vec<XRef> {
        self.xrefs
            .iter()
            .filter(|x| x.from_function == func_address && x.kind == XRefType::Call)
            .cloned()
            .collect()
    }

    /// All references whose target lies inside rodata.
    pub fn rodata_refs(&self, image: &NsoImage) -> Vec<XRef> {
        let rodata = image.rodata();
        let start = image.base_address() + rodata.mem_offset;
        let end = start + rodata.size();

        self.xrefs
            .iter()
            .filter(|x| x.to_address >= start && x.to_address < end)
            .cloned()
            .collect()
    }
}

/// Page address formed by an ADRP: the 21-bit immediate is sign-extended in
/// 64-bit arithmetic and shifted onto the PC page.
pub fn adrp_page(word: u32, address: Address) -> Address {
    let immhi = ((word >> 5) & 0x7_FFFF) as i64;
    let immlo = ((word >> 29) & 0x3) as i64;
    let imm = (immhi << 2) | immlo;
    let imm = imm << 43 >> 43; // sign-extend from 21 bits
    ((address & !0xFFF) as i64 + (imm << 12)) as Address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adrp_page_positive() {
        // ADRP X0, +1 page: immlo = 1, immhi = 0
        let word: u32 = 0xB0000000;
        assert_eq!(adrp_page(word, 0x7100001000), 0x7100002000);
        // The low PC bits are masked off before the page offset is applied.
        assert_eq!(adrp_page(word, 0x7100001FFC), 0x7100002000);
    }

    #[test]
    fn adrp_page_negative() {
        // immlo = 3, immhi = all ones: imm = -1 page
        let word: u32 = (3 << 29) | 0x9000_0000 | (0x7FFFF << 5);
        assert_eq!(adrp_page(word, 0x7100001000), 0x7100000000);
    }

    #[test]
    fn xref_type_round_trips_through_u8() {
        for kind in [
            XRefType::Call,
            XRefType::Jump,
            XRefType::DataRead,
            XRefType::DataWrite,
            XRefType::AddressLoad,
            XRefType::Unknown,
        ] {
            assert_eq!(XRefType::from_u8(kind.as_u8()), kind);
        }
        assert_eq!(XRefType::from_u8(0xFF), XRefType::Unknown);
    }

    #[test]
    fn indices_point_back_at_every_xref() {
        let mut analyzer = XRefAnalyzer::new();
        analyzer.replace(vec![
            XRef {
                from_address: 0x100,
                to_address: 0x200,
                kind: XRefType::Call,
                description: "function call".into(),
                from_function: 0x100,
                from_function_name: "FUN_100".into(),
            },
            XRef {
                from_address: 0x104,
                to_address: 0x200,
                kind: XRefType::Jump,
                description: "branch".into(),
                from_function: 0x100,
                from_function_name: "FUN_100".into(),
            },
        ]);

        let to = analyzer.refs_to(0x200);
        assert_eq!(to.len(), 2);
        assert_eq!(to[0].kind, XRefType::Call);
        assert_eq!(to[1].kind, XRefType::Jump);

        assert_eq!(analyzer.refs_from(0x100).len(), 1);
        assert_eq!(analyzer.refs_from(0x104).len(), 1);
        assert!(analyzer.refs_to(0x300).is_empty());

        assert_eq!(analyzer.calls_to(0x200).len(), 1);
        assert_eq!(analyzer.calls_from(0x100).len(), 1);
    }
}

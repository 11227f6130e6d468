//! Function discovery over the text segment.
//!
//! Candidates are seeded from three sources: the module entry point (the
//! start of text), ARM64 prologue patterns found by scanning every aligned
//! word, and the targets of BL instructions. Each seed is disassembled with
//! a linear sweep until a return.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::loader::NsoImage;
use crate::{Address, Decoder, Instruction};

/// A discovered function.
#[derive(Debug, Clone)]
pub struct Function {
    pub address: Address,
    pub end_address: Address,
    pub size: u64,
    pub name: String,
    pub instructions: Vec<Instruction>,

    /// Callee entry addresses
    pub calls_to: BTreeSet<Address>,
    /// Caller entry addresses
    pub called_from: BTreeSet<Address>,

    /// Half-open basic-block intervals covering `[address, end_address)`
    pub basic_blocks: Vec<(Address, Address)>,

    /// No outgoing calls
    pub is_leaf: bool,
    /// Single branch instruction
    pub is_thunk: bool,
    /// Never returns to the caller
    pub is_noreturn: bool,
}

impl Function {
    /// Default name for a function at `address`.
    pub fn default_name(address: Address) -> String {
        format!("FUN_{:x}", address)
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.address && address < self.end_address
    }
}

/// Discovers and owns the function table, keyed by entry address.
#[derive(Debug, Default)]
pub struct FunctionFinder {
    functions: BTreeMap<Address, Function>,
    analyzed: HashSet<Address>,
}

impl FunctionFinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run all discovery passes over the text segment.
    pub fn find_functions(&mut self, image: &NsoImage, decoder: &dyn Decoder) {
        let text = image.text();
        let base = image.base_address() + text.mem_offset;

        // The module entry point is the start of text.
        if !text.data.is_empty() {
            self.analyze_function(base, image, decoder);
        }

        self.find_by_prologue(image, decoder);
        self.find_by_call_targets(image, decoder);
        self.link_callers();

        log::debug!("function discovery found {} functions", self.functions.len());
    }

    /// Pass 1: scan every aligned word for a prologue pattern.
    fn find_by_prologue(&mut self, image: &NsoImage, decoder: &dyn Decoder) {
        let text = image.text();
        let base = image.base_address() + text.mem_offset;

        for offset in (0..text.data.len().saturating_sub(3)).step_by(4) {
            let word = read_word(&text.data, offset);
            if is_prologue(word) {
                self.analyze_function(base + offset as Address, image, decoder);
            }
        }
    }

    /// Pass 2: mark every in-segment BL target as a function, recovering
    /// entries whose prologue matched no pattern.
    fn find_by_call_targets(&mut self, image: &NsoImage, decoder: &dyn Decoder) {
        let text = image.text();
        let base = image.base_address() + text.mem_offset;
        let end = base + text.size();

        let mut targets = Vec::new();
        for offset in (0..text.data.len().saturating_sub(3)).step_by(4) {
            let word = read_word(&text.data, offset);
            if word & 0xFC00_0000 == 0x9400_0000 {
                let target = bl_target(word, base + offset as Address);
                if target >= base && target < end {
                    targets.push(target);
                }
            }
        }

        for target in targets {
            self.analyze_function(target, image, decoder);
        }
    }

    /// Disassemble one candidate entry. Idempotent: revisiting an address is
    /// a no-op regardless of whether it produced a function.
    pub fn analyze_function(
        &mut self,
        address: Address,
        image: &NsoImage,
        decoder: &dyn Decoder,
    ) -> Option<&Function> {
        if !self.analyzed.insert(address) {
            return self.functions.get(&address);
        }

        let text = image.text();
        let text_base = image.base_address() + text.mem_offset;
        if address < text_base || address >= text_base + text.size() {
            return None;
        }

        let offset = (address - text_base) as usize;
        let instructions = decoder.disassemble_function(&text.data[offset..], address);
        if instructions.is_empty() {
            return None;
        }

        let last = instructions.last().unwrap();
        let end_address = last.address + last.bytes.len() as Address;

        let calls_to: BTreeSet<Address> = instructions
            .iter()
            .filter(|i| i.is_call && i.branch_target != 0)
            .map(|i| i.branch_target)
            .collect();

        let mut func = Function {
            address,
            end_address,
            size: end_address - address,
            name: Function::default_name(address),
            is_leaf: !instructions.iter().any(|i| i.is_call),
            is_thunk: instructions.len() == 1 && instructions[0].is_branch,
            is_noreturn: false,
            calls_to,
            called_from: BTreeSet::new(),
            basic_blocks: Vec::new(),
            instructions,
        };
        func.basic_blocks = compute_basic_blocks(&func);

        Some(self.functions.entry(address).or_insert(func))
    }

    /// Fill `called_from` once all discovery passes have run.
    fn link_callers(&mut self) {
        let mut edges = Vec::new();
        for (caller, func) in &self.functions {
            for callee in &func.calls_to {
                edges.push((*caller, *callee));
            }
        }
        for (caller, callee) in edges {
            if let Some(func) = self.functions.get_mut(&callee) {
                func.called_from.insert(caller);
            }
        }
    }

    pub fn functions(&self) -> &BTreeMap<Address, Function> {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Function whose entry is exactly `address`.
    pub fn function_at(&self, address: Address) -> Option<&Function> {
        self.functions.get(&address)
    }

    /// First function whose range contains `address`.
    pub fn function_containing(&self, address: Address) -> Option<&Function> {
        self.functions.values().find(|f| f.contains(address))
    }

    pub fn rename(&mut self, address: Address, name: impl Into<String>) -> bool {
        match self.functions.get_mut(&address) {
            Some(func) => {
                func.name = name.into();
                true
            }
            None => false,
        }
    }

    /// Replace the table wholesale (snapshot load).
    pub fn replace(&mut self, functions: BTreeMap<Address, Function>) {
        self.analyzed = functions.keys().copied().collect();
        self.functions = functions;
    }

    pub fn clear(&mut self) {
        self.functions.clear();
        self.analyzed.clear();
    }
}

fn read_word(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Whether a word looks like the first instruction of a function.
pub fn is_prologue(word: u32) -> bool {
    // STP Xt, Xt2, [SP, #imm]! with Xt = X29, Xt2 = X30
    if word & 0xFFC0_03E0 == 0xA980_0000 {
        let rt = word & 0x1F;
        let rt2 = (word >> 10) & 0x1F;
        if rt == 29 && rt2 == 30 {
            return true;
        }
    }

    // SUB SP, SP, #imm12
    if word & 0xFF00_03FF == 0xD100_03FF {
        return true;
    }

    // PACIASP
    word == 0xD503_233F
}

/// BL target with the 26-bit immediate sign-extended in 64-bit arithmetic.
fn bl_target(word: u32, address: Address) -> Address {
    let imm26 = (word & 0x03FF_FFFF) as i64;
    let offset = (imm26 << 38 >> 38) * 4;
    (address as i64 + offset) as Address
}

/// Leader-based basic blocks: the entry, every branch/call fall-through and
/// every in-range branch target begin a block; blocks are the consecutive
/// half-open intervals between sorted leaders.
fn compute_basic_blocks(func: &Function) -> Vec<(Address, Address)> {
    let mut leaders = BTreeSet::new();
    leaders.insert(func.address);

    for insn in &func.instructions {
        if insn.is_branch || insn.is_call {
            let next = insn.address + insn.bytes.len() as Address;
            if next < func.end_address {
                leaders.insert(next);
            }
            if insn.branch_target >= func.address && insn.branch_target < func.end_address {
                leaders.insert(insn.branch_target);
            }
        }
    }

    let sorted: Vec<Address> = leaders.into_iter().collect();
    sorted
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = sorted.get(i + 1).copied().unwrap_or(func.end_address);
            (start, end)
        })
        .collect()
}

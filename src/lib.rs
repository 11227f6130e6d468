//! kiloader
//!
//! Static analysis library for Nintendo Switch NSO executables.
//!
//! Given an NSO file this crate reconstructs a model of the program: the
//! three loaded segments, the set of defined functions, the strings embedded
//! in read-only data, and the cross-reference graph between code and data.
//! The model is exposed through a read-only facade ([`analyzer::Analyzer`])
//! and can be persisted to disk keyed by build ID ([`progress`]).
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use kiloader::analyzer::Analyzer;
//!
//! let mut analyzer = Analyzer::new();
//! analyzer.load_nso("path/to/main.nso").unwrap();
//! analyzer.analyze().unwrap();
//!
//! for (addr, func) in analyzer.functions() {
//!     println!("0x{:x}: {} ({} bytes)", addr, func.name, func.size);
//! }
//! ```

pub mod loader;
pub mod decoder;
pub mod strings;
pub mod functions;
pub mod xref;
pub mod pseudocode;
pub mod progress;
pub mod analyzer;
pub mod format;

use std::fmt;

/// Represents a virtual address in the loaded image.
pub type Address = u64;

/// ARM64 instructions are fixed-width.
pub const INSTRUCTION_SIZE: usize = 4;

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Address the instruction executes at
    pub address: Address,
    /// Raw encoding bytes (always 4 for ARM64)
    pub bytes: Vec<u8>,
    /// Instruction mnemonic (e.g., "mov", "bl")
    pub mnemonic: String,
    /// Operands as string representation
    pub operands: String,

    /// True for B, B.cond, CBZ/CBNZ, TBZ/TBNZ, BR
    pub is_branch: bool,
    /// True for BL and BLR
    pub is_call: bool,
    /// True for RET
    pub is_return: bool,
    /// True when the mnemonic starts with "ld"
    pub is_load: bool,
    /// True when the mnemonic starts with "st"
    pub is_store: bool,
    /// Absolute target of PC-relative immediate branches, 0 otherwise
    pub branch_target: Address,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}: ", self.address)?;
        for b in &self.bytes {
            write!(f, "{:02X} ", b)?;
        }
        for _ in self.bytes.len()..INSTRUCTION_SIZE {
            write!(f, "   ")?;
        }
        write!(f, "{} {}", self.mnemonic, self.operands)
    }
}

/// Instruction-count ceiling for a single function sweep, so malformed code
/// cannot produce unbounded instruction lists.
pub const MAX_FUNCTION_INSNS: usize = 10_000;

/// Decoder trait: turns raw bytes into [`Instruction`]s.
///
/// Implementors decode exactly one instruction per call; `code` is the byte
/// slice beginning at `address`. The linear function sweep is provided on
/// top of `decode`.
pub trait Decoder {
    /// Decode one instruction at `address`. Returns `None` if the bytes do
    /// not form a valid ARM64 instruction.
    fn decode(&self, code: &[u8], address: Address) -> Option<Instruction>;

    /// Linear sweep from `address`, stopping at the first return, the first
    /// decode failure, or [`MAX_FUNCTION_INSNS`] instructions.
    fn disassemble_function(&self, code: &[u8], address: Address) -> Vec<Instruction> {
        let mut result = Vec::new();
        let mut offset = 0usize;

        while offset + INSTRUCTION_SIZE <= code.len() {
            let insn = match self.decode(&code[offset..], address + offset as Address) {
                Some(i) => i,
                None => break,
            };
            if insn.bytes.is_empty() {
                break;
            }

            let is_return = insn.is_return;
            offset += insn.bytes.len();
            result.push(insn);

            if is_return {
                break;
            }
            if result.len() >= MAX_FUNCTION_INSNS {
                break;
            }
        }

        result
    }
}

/// Errors produced by the analysis pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    /// File open, read or write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed NSO or snapshot contents
    #[error("format error: {0}")]
    Format(String),

    /// Query issued before an NSO was loaded
    #[error("no NSO loaded")]
    NotLoaded,

    /// Query issued before analysis ran
    #[error("analysis has not been run")]
    NotAnalyzed,

    /// Virtual-address read crossed a segment boundary
    #[error("address 0x{0:x} is outside every loaded segment")]
    AddressOutOfRange(Address),

    /// Decoder could not produce an instruction
    #[error("failed to decode instruction at 0x{0:x}")]
    Decode(Address),

    /// Unparseable address or function-name token
    #[error("invalid address or function name: {0}")]
    ParseAddress(String),
}

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! Analysis facade.
//!
//! Owns the loaded image and all result tables, coordinates the pipeline
//! (strings, functions, cross-references) and exposes the read-only query
//! surface used by frontends. `analyze` is the single mutation epoch: the
//! tables are cleared, repopulated and indexed before it returns.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::decoder::CapstoneDecoder;
use crate::format::{AnalysisReport, ExportFormat};
use crate::functions::{Function, FunctionFinder};
use crate::loader::NsoImage;
use crate::progress::ProgressStore;
use crate::pseudocode;
use crate::strings::{StringEntry, StringTable};
use crate::xref::{XRef, XRefAnalyzer};
use crate::{Address, AnalyzerError, Instruction, INSTRUCTION_SIZE};

/// Default instruction count for windowed disassembly.
pub const DEFAULT_DISASM_COUNT: usize = 20;

/// Coordinates the pipeline and owns every result table.
pub struct Analyzer {
    image: Option<NsoImage>,
    decoder: Option<CapstoneDecoder>,
    functions: FunctionFinder,
    strings: StringTable,
    xrefs: XRefAnalyzer,
    progress: ProgressStore,
    build_id: Option<String>,
    analyzed: bool,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Analyzer {
            image: None,
            decoder: None,
            functions: FunctionFinder::new(),
            strings: StringTable::new(),
            xrefs: XRefAnalyzer::new(),
            progress: ProgressStore::new(),
            build_id: None,
            analyzed: false,
        }
    }

    /// Load an NSO, discarding any previous image and analysis.
    pub fn load_nso<P: AsRef<Path>>(&mut self, path: P) -> Result<(), AnalyzerError> {
        let image = NsoImage::load(path)?;
        let decoder = CapstoneDecoder::new()?;

        self.build_id = Some(image.build_id());
        self.image = Some(image);
        self.decoder = Some(decoder);
        self.functions.clear();
        self.strings.clear();
        self.xrefs.clear();
        self.analyzed = false;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.image.is_some()
    }

    pub fn is_analyzed(&self) -> bool {
        self.analyzed
    }

    pub fn image(&self) -> Option<&NsoImage> {
        self.image.as_ref()
    }

    /// Build ID of the loaded image or restored snapshot.
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    fn require_image(&self) -> Result<&NsoImage, AnalyzerError> {
        self.image.as_ref().ok_or(AnalyzerError::NotLoaded)
    }

    fn require_analyzed(&self) -> Result<(), AnalyzerError> {
        if self.analyzed {
            Ok(())
        } else {
            Err(AnalyzerError::NotAnalyzed)
        }
    }

    /// Run the full pipeline: strings, functions, cross-references.
    pub fn analyze(&mut self) -> Result<(), AnalyzerError> {
        let image = self.image.as_ref().ok_or(AnalyzerError::NotLoaded)?;
        let decoder = self.decoder.as_ref().ok_or(AnalyzerError::NotLoaded)?;

        self.strings.clear();
        self.functions.clear();
        self.xrefs.clear();

        self.strings.scan(image);
        self.functions.find_functions(image, decoder);
        self.xrefs.analyze(image, &self.functions);

        self.analyzed = true;
        Ok(())
    }

    /// Disassemble up to `count` instructions at `addr`, clamped to the end
    /// of the containing segment.
    pub fn disassemble_at(
        &self,
        addr: Address,
        count: usize,
    ) -> Result<Vec<Instruction>, AnalyzerError> {
        let image = self.require_image()?;
        let decoder = self.decoder.as_ref().ok_or(AnalyzerError::NotLoaded)?;

        let seg = image
            .segment_at(addr)
            .ok_or(AnalyzerError::AddressOutOfRange(addr))?;
        let seg_offset = (addr - image.base_address() - seg.mem_offset) as usize;
        let available = seg.data.len() - seg_offset;
        let size = (count * INSTRUCTION_SIZE).min(available);

        let code = image.read_memory(addr, size)?;
        Ok(decoder.disassemble_at(code, addr, count))
    }

    /// Function whose entry is exactly `addr`.
    pub fn function_at(&self, addr: Address) -> Result<Option<&Function>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(self.functions.function_at(addr))
    }

    /// Function whose range contains `addr`.
    pub fn function_containing(&self, addr: Address) -> Result<Option<&Function>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(self.functions.function_containing(addr))
    }

    /// Pseudocode listing for the function at `addr`.
    pub fn pseudocode_at(&self, addr: Address) -> Result<String, AnalyzerError> {
        self.require_analyzed()?;
        Ok(pseudocode::generate_at(addr, &self.functions))
    }

    /// References pointing at `addr`.
    pub fn refs_to(&self, addr: Address) -> Result<Vec<XRef>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(self.xrefs.refs_to(addr))
    }

    /// References originating at `addr`.
    pub fn refs_from(&self, addr: Address) -> Result<Vec<XRef>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(self.xrefs.refs_from(addr))
    }

    /// All references whose target lies inside rodata.
    pub fn rodata_refs(&self) -> Result<Vec<XRef>, AnalyzerError> {
        let image = self.require_image()?;
        self.require_analyzed()?;
        Ok(self.xrefs.rodata_refs(image))
    }

    /// Substring search over the string table.
    pub fn search_strings(
        &self,
        pattern: &str,
        case_sensitive: bool,
    ) -> Result<Vec<StringEntry>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(self.strings.search(pattern, case_sensitive))
    }

    /// Address of the string exactly equal to `s`.
    pub fn find_string_exact(&self, s: &str) -> Result<Option<Address>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(self
            .strings
            .search(s, true)
            .into_iter()
            .find(|entry| entry.value == s)
            .map(|entry| entry.address))
    }

    pub fn functions(&self) -> &BTreeMap<Address, Function> {
        self.functions.functions()
    }

    pub fn strings(&self) -> &[StringEntry] {
        self.strings.strings()
    }

    pub fn xrefs(&self) -> &[XRef] {
        self.xrefs.xrefs()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn string_count(&self) -> usize {
        self.strings.len()
    }

    pub fn xref_count(&self) -> usize {
        self.xrefs.len()
    }

    /// Rename a function; false when no function starts at `addr`.
    pub fn rename_function(&mut self, addr: Address, name: impl Into<String>) -> bool {
        self.functions.rename(addr, name)
    }

    fn report(&self) -> Result<AnalysisReport<'_>, AnalyzerError> {
        self.require_analyzed()?;
        Ok(AnalysisReport {
            build_id: self.build_id.clone().unwrap_or_default(),
            functions: self.functions.functions(),
            strings: self.strings.strings(),
            xrefs: self.xrefs.xrefs(),
        })
    }

    /// Write the full analysis dump in the requested format.
    pub fn export_dump<P: AsRef<Path>>(
        &self,
        path: P,
        format: ExportFormat,
    ) -> Result<(), AnalyzerError> {
        let report = self.report()?;
        let text = format.formatter().format(&report)?;
        fs::write(path, text)?;
        Ok(())
    }

    /// Write the full analysis dump as plain text.
    pub fn export_text_dump<P: AsRef<Path>>(&self, path: P) -> Result<(), AnalyzerError> {
        self.export_dump(path, ExportFormat::Text)
    }

    /// Write the function list, one `0x<addr>|name|size` line each.
    pub fn export_functions<P: AsRef<Path>>(&self, path: P) -> Result<(), AnalyzerError> {
        self.require_analyzed()?;
        let mut out = String::new();
        for (addr, func) in self.functions.functions() {
            out.push_str(&format!("0x{:x}|{}|{}\n", addr, func.name, func.size));
        }
        fs::write(path, out)?;
        Ok(())
    }

    /// Write the string list, one `0x<addr>|value` line each.
    pub fn export_strings<P: AsRef<Path>>(&self, path: P) -> Result<(), AnalyzerError> {
        self.require_analyzed()?;
        let mut out = String::new();
        for s in self.strings.strings() {
            out.push_str(&format!("0x{:x}|{}\n", s.address, s.value));
        }
        fs::write(path, out)?;
        Ok(())
    }

    pub fn progress_dir(&self) -> &Path {
        self.progress.base_dir()
    }

    pub fn set_progress_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        self.progress.set_base_dir(dir);
    }

    /// Persist the current analysis, keyed by the image build ID.
    pub fn save_progress(&self) -> Result<PathBuf, AnalyzerError> {
        let image = self.require_image()?;
        self.require_analyzed()?;

        self.progress.save(
            &image.build_id(),
            self.functions.functions(),
            self.strings.strings(),
            self.xrefs.xrefs(),
            (
                image.text().size(),
                image.rodata().size(),
                image.data().size(),
            ),
        )
    }

    /// Restore a snapshot, replacing every table in one step. On failure the
    /// current tables are left untouched.
    pub fn load_progress(&mut self, build_id: &str) -> Result<(), AnalyzerError> {
        let snapshot = self.progress.load(build_id)?;

        self.build_id = Some(snapshot.header.build_id.clone());
        self.functions.replace(snapshot.functions);
        self.strings.replace(snapshot.strings);
        self.xrefs.replace(snapshot.xrefs);
        self.analyzed = true;
        Ok(())
    }

    pub fn has_progress(&self, build_id: &str) -> bool {
        self.progress.has_progress(build_id)
    }

    pub fn list_progress(&self) -> Vec<String> {
        self.progress.list_progress()
    }

    pub fn delete_progress(&self, build_id: &str) -> Result<(), AnalyzerError> {
        self.progress.delete_progress(build_id)
    }
}

/// Parse an address token: decimal, `0x`-prefixed hex, or a `FUN_<hex>` /
/// `SUB_<hex>` style function name (prefix matched case-insensitively).
pub fn parse_address_or_name(s: &str) -> Result<Address, AnalyzerError> {
    if let Some(addr) = parse_function_name(s) {
        return Ok(addr);
    }

    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Address::from_str_radix(hex, 16)
    } else {
        s.parse::<Address>()
    };

    parsed.map_err(|_| AnalyzerError::ParseAddress(s.to_string()))
}

fn parse_function_name(s: &str) -> Option<Address> {
    let upper = s.to_uppercase();
    let hex = upper.strip_prefix("FUN_").or_else(|| upper.strip_prefix("SUB_"))?;
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Address::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_and_decimal_addresses() {
        assert_eq!(parse_address_or_name("0x7100001000").unwrap(), 0x7100001000);
        assert_eq!(parse_address_or_name("0X10").unwrap(), 0x10);
        assert_eq!(parse_address_or_name("4096").unwrap(), 4096);
    }

    #[test]
    fn parses_function_names() {
        assert_eq!(
            parse_address_or_name("FUN_7104e53010").unwrap(),
            0x7104e53010
        );
        assert_eq!(parse_address_or_name("sub_1000").unwrap(), 0x1000);
        assert_eq!(parse_address_or_name("fun_ABC").unwrap(), 0xABC);
    }

    #[test]
    fn rejects_junk_tokens() {
        assert!(parse_address_or_name("FUN_").is_err());
        assert!(parse_address_or_name("FUN_xyz").is_err());
        assert!(parse_address_or_name("banana").is_err());
        assert!(parse_address_or_name("0x").is_err());
    }

    #[test]
    fn queries_before_load_fail_typed() {
        let analyzer = Analyzer::new();
        assert!(matches!(
            analyzer.disassemble_at(0x7100000000, 4),
            Err(AnalyzerError::NotLoaded)
        ));
        assert!(matches!(
            analyzer.refs_to(0x7100000000),
            Err(AnalyzerError::NotAnalyzed)
        ));
        assert!(matches!(
            analyzer.search_strings("x", false),
            Err(AnalyzerError::NotAnalyzed)
        ));
        assert!(matches!(
            analyzer.save_progress(),
            Err(AnalyzerError::NotLoaded)
        ));
    }
}

//! String recovery over the read-only data segment.
//!
//! Scans rodata for maximal runs of printable characters terminated by a
//! zero byte. The scan is chunked across workers; each worker may read past
//! its chunk end (bounded overlap) to complete a string that straddles the
//! boundary, but only emits strings that *start* inside its own chunk, so
//! the merged table matches a sequential scan.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::loader::NsoImage;
use crate::Address;

/// Default minimum string length in bytes.
pub const DEFAULT_MIN_LENGTH: usize = 4;

/// Number of scan chunks.
const NUM_CHUNKS: usize = 16;

/// How far a worker may extend past its chunk end to finish a string.
const CHUNK_OVERLAP: usize = 256;

/// One recovered string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringEntry {
    /// Address of the first byte of the string
    pub address: Address,
    /// The string contents (terminator excluded)
    pub value: String,
    /// Length in code units
    pub length: u64,
    /// True for UTF-16 strings (never produced by the ASCII scanner)
    pub is_wide: bool,
}

/// Table of strings recovered from rodata, sorted by address.
#[derive(Debug)]
pub struct StringTable {
    strings: Vec<StringEntry>,
    address_map: HashMap<Address, usize>,
    min_length: usize,
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StringTable {
    pub fn new() -> Self {
        StringTable {
            strings: Vec::new(),
            address_map: HashMap::new(),
            min_length: DEFAULT_MIN_LENGTH,
        }
    }

    pub fn with_min_length(min_length: usize) -> Self {
        StringTable {
            min_length,
            ..Self::new()
        }
    }

    /// Scan the rodata segment, replacing the current table.
    pub fn scan(&mut self, image: &NsoImage) {
        let rodata = image.rodata();
        let base = image.base_address() + rodata.mem_offset;

        self.strings = scan_parallel(&rodata.data, base, self.min_length);
        self.rebuild_index();

        log::debug!("string scan found {} strings", self.strings.len());
    }

    /// Replace the table wholesale (snapshot load).
    pub fn replace(&mut self, strings: Vec<StringEntry>) {
        self.strings = strings;
        self.rebuild_index();
    }

    pub fn clear(&mut self) {
        self.strings.clear();
        self.address_map.clear();
    }

    fn rebuild_index(&mut self) {
        self.strings.sort_by_key(|s| s.address);
        self.address_map = self
            .strings
            .iter()
            .enumerate()
            .map(|(i, s)| (s.address, i))
            .collect();
    }

    pub fn strings(&self) -> &[StringEntry] {
        &self.strings
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    /// Substring search. Case folding is applied to the pattern and each
    /// candidate, never to the stored table.
    pub fn search(&self, pattern: &str, case_sensitive: bool) -> Vec<StringEntry> {
        let folded = if case_sensitive {
            pattern.to_string()
        } else {
            pattern.to_lowercase()
        };

        self.strings
            .iter()
            .filter(|entry| {
                if case_sensitive {
                    entry.value.contains(&folded)
                } else {
                    entry.value.to_lowercase().contains(&folded)
                }
            })
            .cloned()
            .collect()
    }

    /// String starting exactly at `address`.
    pub fn string_at(&self, address: Address) -> Option<&StringEntry> {
        self.address_map.get(&address).map(|&i| &self.strings[i])
    }

    pub fn is_string(&self, address: Address) -> bool {
        self.address_map.contains_key(&address)
    }

    /// Value at `address`, empty when no string starts there.
    pub fn value_at(&self, address: Address) -> &str {
        self.string_at(address).map(|s| s.value.as_str()).unwrap_or("")
    }
}

/// Printable ASCII plus tab, newline and carriage return.
pub fn is_valid_string_char(c: u8) -> bool {
    (0x20..=0x7E).contains(&c) || c == b'\t' || c == b'\n' || c == b'\r'
}

fn scan_parallel(data: &[u8], base: Address, min_length: usize) -> Vec<StringEntry> {
    if data.is_empty() {
        return Vec::new();
    }

    let chunk_len = (data.len() + NUM_CHUNKS - 1) / NUM_CHUNKS;
    let chunks: Vec<(usize, usize)> = (0..NUM_CHUNKS)
        .map(|i| {
            let start = (i * chunk_len).min(data.len());
            let end = ((i + 1) * chunk_len).min(data.len());
            (start, end)
        })
        .filter(|(start, end)| start < end)
        .collect();

    let results: Vec<Vec<StringEntry>> = chunks
        .into_par_iter()
        .map(|(start, end)| scan_chunk(data, base, start, end, min_length))
        .collect();

    results.into_iter().flatten().collect()
}

/// Scan one chunk. Strings must start in `[chunk_start, chunk_end)` but may
/// terminate up to [`CHUNK_OVERLAP`] bytes beyond `chunk_end`.
fn scan_chunk(
    data: &[u8],
    base: Address,
    chunk_start: usize,
    chunk_end: usize,
    min_length: usize,
) -> Vec<StringEntry> {
    let mut entries = Vec::new();
    let limit = (chunk_end + CHUNK_OVERLAP).min(data.len());
    let mut i = chunk_start;

    // A run crossing the chunk boundary belongs to the previous chunk; skip
    // to its terminator so a suffix is never reported as a fresh string.
    if chunk_start > 0 && is_valid_string_char(data[chunk_start - 1]) {
        while i < limit && is_valid_string_char(data[i]) {
            i += 1;
        }
        i += 1; // consume the terminator or offending byte
    }

    while i < chunk_end {
        if !is_valid_string_char(data[i]) {
            i += 1;
            continue;
        }

        let start = i;
        let mut j = i;
        while j < limit && data[j] != 0 && is_valid_string_char(data[j]) {
            j += 1;
        }

        if j < limit && data[j] == 0 {
            let len = j - start;
            if len >= min_length {
                // The run is validated ASCII, so the conversion cannot fail.
                let value = String::from_utf8_lossy(&data[start..j]).into_owned();
                entries.push(StringEntry {
                    address: base + start as Address,
                    value,
                    length: len as u64,
                    is_wide: false,
                });
            }
            i = j + 1;
        } else if j < limit {
            // Invalid byte inside the run discards it; resume after it.
            i = j + 1;
        } else {
            // Ran off the scan window without a terminator.
            i = j;
        }
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference single-threaded scan, used to validate the parallel one.
    fn scan_sequential(data: &[u8], base: Address, min_length: usize) -> Vec<StringEntry> {
        let mut entries = Vec::new();
        let mut i = 0usize;

        while i < data.len() {
            if !is_valid_string_char(data[i]) {
                i += 1;
                continue;
            }
            let start = i;
            let mut j = i;
            while j < data.len() && data[j] != 0 && is_valid_string_char(data[j]) {
                j += 1;
            }
            if j < data.len() && data[j] == 0 {
                let len = j - start;
                if len >= min_length {
                    entries.push(StringEntry {
                        address: base + start as Address,
                        value: String::from_utf8_lossy(&data[start..j]).into_owned(),
                        length: len as u64,
                        is_wide: false,
                    });
                }
            }
            i = j + 1;
        }

        entries
    }

    #[test]
    fn finds_terminated_strings() {
        let mut data = b"junk\x01hello world\0more\0".to_vec();
        data.push(0xFF);
        let found = scan_parallel(&data, 0x1000, 4);
        let values: Vec<&str> = found.iter().map(|s| s.value.as_str()).collect();
        assert_eq!(values, vec!["junk", "hello world", "more"]);
    }

    #[test]
    fn short_strings_are_dropped() {
        let data = b"ab\0abcd\0".to_vec();
        let found = scan_parallel(&data, 0, 4);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "abcd");
        assert_eq!(found[0].address, 3);
        assert_eq!(found[0].length, 4);
    }

    #[test]
    fn run_with_invalid_byte_is_discarded() {
        // 0x01 interrupts the run before a terminator; the whole run drops.
        let data = b"abcd\x01efgh\0".to_vec();
        let found = scan_parallel(&data, 0, 4);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "efgh");
    }

    #[test]
    fn unterminated_trailing_run_is_dropped() {
        let data = b"valid\0endless".to_vec();
        let found = scan_parallel(&data, 0, 4);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].value, "valid");
    }

    #[test]
    fn parallel_matches_sequential_on_boundary_straddle() {
        // 32 bytes / 16 chunks = 2-byte chunks, so "hello" spans several
        // chunk boundaries and every continuation-skip path is exercised.
        let mut data = vec![0u8; 32];
        data[1..6].copy_from_slice(b"hello");
        // data[6] is already the 0 terminator
        data[9..14].copy_from_slice(b"world");
        let parallel = scan_parallel(&data, 0x2000, 4);
        let sequential = scan_sequential(&data, 0x2000, 4);
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.len(), 2);
        assert_eq!(parallel[0].value, "hello");
        assert_eq!(parallel[0].address, 0x2001);
    }

    #[test]
    fn parallel_matches_sequential_on_mixed_data() {
        let mut data = Vec::new();
        for i in 0..1024u32 {
            match i % 7 {
                0 => data.extend_from_slice(b"needle\0"),
                1 => data.push(0x00),
                2 => data.push((i % 256) as u8),
                3 => data.extend_from_slice(b"ab\0"),
                4 => data.extend_from_slice(b"interrupted\x02run\0"),
                _ => data.push(b'x'),
            }
        }
        let parallel = scan_parallel(&data, 0x7100002000, 4);
        let sequential = scan_sequential(&data, 0x7100002000, 4);
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn search_is_case_insensitive_by_default() {
        let mut table = StringTable::new();
        table.replace(vec![
            StringEntry {
                address: 0x10,
                value: "Hello World".into(),
                length: 11,
                is_wide: false,
            },
            StringEntry {
                address: 0x30,
                value: "other".into(),
                length: 5,
                is_wide: false,
            },
        ]);

        assert_eq!(table.search("hello", false).len(), 1);
        assert_eq!(table.search("hello", true).len(), 0);
        assert_eq!(table.search("Hello", true).len(), 1);
    }

    #[test]
    fn address_lookups() {
        let mut table = StringTable::new();
        table.replace(vec![StringEntry {
            address: 0x40,
            value: "entry".into(),
            length: 5,
            is_wide: false,
        }]);

        assert!(table.is_string(0x40));
        assert!(!table.is_string(0x41));
        assert_eq!(table.value_at(0x40), "entry");
        assert_eq!(table.value_at(0x44), "");
    }
}

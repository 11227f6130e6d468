//! Persistent analysis snapshots, keyed by build ID.
//!
//! One snapshot per build lives at `<base_dir>/<build_id[..16]>/progress.bin`
//! as a little-endian binary file: a fixed header with table counts followed
//! by the function, string and xref records. The reader validates magic and
//! version and parses the whole file before anything is handed back, so a
//! bad file never leaves partial state behind.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::functions::Function;
use crate::strings::StringEntry;
use crate::xref::{XRef, XRefType};
use crate::{Address, AnalyzerError};

/// Snapshot magic, "KILO" in little-endian.
pub const PROGRESS_MAGIC: u32 = 0x4F4C_494B;
pub const PROGRESS_VERSION: u32 = 1;

const PROGRESS_FILE: &str = "progress.bin";

/// Fixed-size snapshot header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressHeader {
    pub magic: u32,
    pub version: u32,
    /// NUL-padded ASCII hex build ID
    pub build_id: String,
    pub function_count: u64,
    pub string_count: u64,
    pub xref_count: u64,
    pub text_size: u64,
    pub rodata_size: u64,
    pub data_size: u64,
}

/// A fully parsed snapshot, ready to replace the live tables.
#[derive(Debug)]
pub struct Snapshot {
    pub header: ProgressHeader,
    pub functions: BTreeMap<Address, Function>,
    pub strings: Vec<StringEntry>,
    pub xrefs: Vec<XRef>,
}

/// Reads and writes snapshots under a base directory.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    base_dir: PathBuf,
}

impl Default for ProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressStore {
    /// Store rooted at `<executable_dir>/kiloader/tmp`.
    pub fn new() -> Self {
        let base_dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiloader")
            .join("tmp");
        ProgressStore { base_dir }
    }

    pub fn with_base_dir<P: Into<PathBuf>>(base_dir: P) -> Self {
        ProgressStore {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn set_base_dir<P: Into<PathBuf>>(&mut self, dir: P) {
        self.base_dir = dir.into();
    }

    /// Directory for one build: the first 16 characters of the build ID.
    pub fn progress_dir(&self, build_id: &str) -> PathBuf {
        let short = &build_id[..build_id.len().min(16)];
        self.base_dir.join(short)
    }

    fn progress_file(&self, build_id: &str) -> PathBuf {
        self.progress_dir(build_id).join(PROGRESS_FILE)
    }

    pub fn has_progress(&self, build_id: &str) -> bool {
        self.progress_file(build_id).is_file()
    }

    /// Write a snapshot for `build_id`, replacing any previous one.
    pub fn save(
        &self,
        build_id: &str,
        functions: &BTreeMap<Address, Function>,
        strings: &[StringEntry],
        xrefs: &[XRef],
        segment_sizes: (u64, u64, u64),
    ) -> Result<PathBuf, AnalyzerError> {
        let dir = self.progress_dir(build_id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(PROGRESS_FILE);

        let mut w = BufWriter::new(File::create(&path)?);

        w.write_u32::<LE>(PROGRESS_MAGIC)?;
        w.write_u32::<LE>(PROGRESS_VERSION)?;
        let mut id_bytes = [0u8; 64];
        for (i, b) in build_id.bytes().take(64).enumerate() {
            id_bytes[i] = b;
        }
        w.write_all(&id_bytes)?;
        w.write_u64::<LE>(functions.len() as u64)?;
        w.write_u64::<LE>(strings.len() as u64)?;
        w.write_u64::<LE>(xrefs.len() as u64)?;
        w.write_u64::<LE>(segment_sizes.0)?;
        w.write_u64::<LE>(segment_sizes.1)?;
        w.write_u64::<LE>(segment_sizes.2)?;

        for func in functions.values() {
            w.write_u64::<LE>(func.address)?;
            w.write_u64::<LE>(func.end_address)?;
            w.write_u64::<LE>(func.size)?;
            let flags = (func.is_leaf as u8)
                | ((func.is_thunk as u8) << 1)
                | ((func.is_noreturn as u8) << 2);
            w.write_u8(flags)?;
            write_string(&mut w, &func.name)?;
        }

        for entry in strings {
            w.write_u64::<LE>(entry.address)?;
            w.write_u64::<LE>(entry.length)?;
            w.write_u8(entry.is_wide as u8)?;
            write_string(&mut w, &entry.value)?;
        }

        for xref in xrefs {
            w.write_u64::<LE>(xref.from_address)?;
            w.write_u64::<LE>(xref.to_address)?;
            w.write_u8(xref.kind.as_u8())?;
            w.write_u64::<LE>(xref.from_function)?;
            write_string(&mut w, &xref.description)?;
            write_string(&mut w, &xref.from_function_name)?;
        }

        w.flush()?;
        Ok(path)
    }

    /// Read the snapshot for `build_id` in full.
    pub fn load(&self, build_id: &str) -> Result<Snapshot, AnalyzerError> {
        let path = self.progress_file(build_id);
        let mut r = BufReader::new(File::open(&path)?);

        let header = read_header(&mut r)?;

        let mut functions = BTreeMap::new();
        for _ in 0..header.function_count {
            let address = r.read_u64::<LE>()?;
            let end_address = r.read_u64::<LE>()?;
            let size = r.read_u64::<LE>()?;
            let flags = r.read_u8()?;
            let name = read_string(&mut r)?;
            functions.insert(
                address,
                Function {
                    address,
                    end_address,
                    size,
                    name,
                    instructions: Vec::new(),
                    calls_to: BTreeSet::new(),
                    called_from: BTreeSet::new(),
                    basic_blocks: Vec::new(),
                    is_leaf: flags & 1 != 0,
                    is_thunk: flags & 2 != 0,
                    is_noreturn: flags & 4 != 0,
                },
            );
        }

        let mut strings = Vec::with_capacity(header.string_count as usize);
        for _ in 0..header.string_count {
            let address = r.read_u64::<LE>()?;
            let length = r.read_u64::<LE>()?;
            let is_wide = r.read_u8()? != 0;
            let value = read_string(&mut r)?;
            strings.push(StringEntry {
                address,
                value,
                length,
                is_wide,
            });
        }

        let mut xrefs = Vec::with_capacity(header.xref_count as usize);
        for _ in 0..header.xref_count {
            let from_address = r.read_u64::<LE>()?;
            let to_address = r.read_u64::<LE>()?;
            let kind = XRefType::from_u8(r.read_u8()?);
            let from_function = r.read_u64::<LE>()?;
            let description = read_string(&mut r)?;
            let from_function_name = read_string(&mut r)?;
            xrefs.push(XRef {
                from_address,
                to_address,
                kind,
                description,
                from_function,
                from_function_name,
            });
        }

        Ok(Snapshot {
            header,
            functions,
            strings,
            xrefs,
        })
    }

    /// Build IDs of every stored snapshot, read from the file headers rather
    /// than the directory names. Unreadable entries are skipped.
    pub fn list_progress(&self) -> Vec<String> {
        let mut result = Vec::new();
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(e) => e,
            Err(_) => return result,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let file = path.join(PROGRESS_FILE);
            if let Ok(f) = File::open(&file) {
                let mut r = BufReader::new(f);
                if let Ok(header) = read_header(&mut r) {
                    result.push(header.build_id);
                }
            }
        }

        result.sort();
        result
    }

    /// Remove a stored snapshot, including its directory.
    pub fn delete_progress(&self, build_id: &str) -> Result<(), AnalyzerError> {
        fs::remove_dir_all(self.progress_dir(build_id))?;
        Ok(())
    }
}

fn read_header<R: Read>(r: &mut R) -> Result<ProgressHeader, AnalyzerError> {
    let magic = r.read_u32::<LE>()?;
    if magic != PROGRESS_MAGIC {
        return Err(AnalyzerError::Format(format!(
            "bad snapshot magic 0x{:08x}",
            magic
        )));
    }
    let version = r.read_u32::<LE>()?;
    if version != PROGRESS_VERSION {
        return Err(AnalyzerError::Format(format!(
            "unsupported snapshot version {}",
            version
        )));
    }

    let mut id_bytes = [0u8; 64];
    r.read_exact(&mut id_bytes)?;
    let end = id_bytes.iter().position(|&b| b == 0).unwrap_or(64);
    let build_id = String::from_utf8_lossy(&id_bytes[..end]).into_owned();

    Ok(ProgressHeader {
        magic,
        version,
        build_id,
        function_count: r.read_u64::<LE>()?,
        string_count: r.read_u64::<LE>()?,
        xref_count: r.read_u64::<LE>()?,
        text_size: r.read_u64::<LE>()?,
        rodata_size: r.read_u64::<LE>()?,
        data_size: r.read_u64::<LE>()?,
    })
}

fn write_string<W: Write>(w: &mut W, s: &str) -> Result<(), AnalyzerError> {
    w.write_u32::<LE>(s.len() as u32)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

fn read_string<R: Read>(r: &mut R) -> Result<String, AnalyzerError> {
    let len = r.read_u32::<LE>()? as usize;
    let mut bytes = vec![0u8; len];
    r.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| AnalyzerError::Format("snapshot string is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_tables() -> (BTreeMap<Address, Function>, Vec<StringEntry>, Vec<XRef>) {
        let mut functions = BTreeMap::new();
        functions.insert(
            0x7100000000,
            Function {
                address: 0x7100000000,
                end_address: 0x7100000008,
                size: 8,
                name: "FUN_7100000000".into(),
                instructions: Vec::new(),
                calls_to: BTreeSet::new(),
                called_from: BTreeSet::new(),
                basic_blocks: Vec::new(),
                is_leaf: true,
                is_thunk: false,
                is_noreturn: false,
            },
        );
        functions.insert(
            0x7100000010,
            Function {
                address: 0x7100000010,
                end_address: 0x7100000014,
                size: 4,
                name: "trampoline".into(),
                instructions: Vec::new(),
                calls_to: BTreeSet::new(),
                called_from: BTreeSet::new(),
                basic_blocks: Vec::new(),
                is_leaf: true,
                is_thunk: true,
                is_noreturn: false,
            },
        );

        let strings = vec![StringEntry {
            address: 0x7100001000,
            value: "hello".into(),
            length: 5,
            is_wide: false,
        }];

        let xrefs = vec![XRef {
            from_address: 0x7100000004,
            to_address: 0x7100000010,
            kind: XRefType::Call,
            description: "function call".into(),
            from_function: 0x7100000000,
            from_function_name: "FUN_7100000000".into(),
        }];

        (functions, strings, xrefs)
    }

    #[test]
    fn string_helpers_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, "kiloader").unwrap();
        write_string(&mut buf, "").unwrap();
        let mut r = Cursor::new(buf);
        assert_eq!(read_string(&mut r).unwrap(), "kiloader");
        assert_eq!(read_string(&mut r).unwrap(), "");
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::with_base_dir(dir.path());
        let build_id = "AB".repeat(32);
        let (functions, strings, xrefs) = sample_tables();

        store
            .save(&build_id, &functions, &strings, &xrefs, (8, 16, 0))
            .unwrap();
        assert!(store.has_progress(&build_id));

        let snapshot = store.load(&build_id).unwrap();
        assert_eq!(snapshot.header.build_id, build_id);
        assert_eq!(snapshot.header.function_count, 2);
        assert_eq!(snapshot.header.text_size, 8);
        assert_eq!(snapshot.strings, strings);
        assert_eq!(snapshot.xrefs, xrefs);

        let f = &snapshot.functions[&0x7100000010];
        assert_eq!(f.name, "trampoline");
        assert!(f.is_thunk);
        assert!(f.is_leaf);
        assert!(!f.is_noreturn);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::with_base_dir(dir.path());
        let build_id = "CD".repeat(32);
        let (functions, strings, xrefs) = sample_tables();
        let path = store
            .save(&build_id, &functions, &strings, &xrefs, (0, 0, 0))
            .unwrap();

        let mut raw = fs::read(&path).unwrap();
        raw[0] = 0;
        fs::write(&path, &raw).unwrap();
        assert!(matches!(
            store.load(&build_id),
            Err(AnalyzerError::Format(_))
        ));

        raw[0] = (PROGRESS_MAGIC & 0xFF) as u8;
        raw[4] = 99;
        fs::write(&path, &raw).unwrap();
        assert!(matches!(
            store.load(&build_id),
            Err(AnalyzerError::Format(_))
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::with_base_dir(dir.path());
        let build_id = "EF".repeat(32);
        let (functions, strings, xrefs) = sample_tables();
        let path = store
            .save(&build_id, &functions, &strings, &xrefs, (0, 0, 0))
            .unwrap();

        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 10]).unwrap();
        assert!(matches!(store.load(&build_id), Err(AnalyzerError::Io(_))));
    }

    #[test]
    fn missing_snapshot_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::with_base_dir(dir.path());
        assert!(matches!(
            store.load(&"00".repeat(32)),
            Err(AnalyzerError::Io(_))
        ));
    }

    #[test]
    fn lists_build_ids_from_headers() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::with_base_dir(dir.path());
        let (functions, strings, xrefs) = sample_tables();

        let id_a = "AA".repeat(32);
        let id_b = "BB".repeat(32);
        store
            .save(&id_a, &functions, &strings, &xrefs, (0, 0, 0))
            .unwrap();
        store
            .save(&id_b, &functions, &strings, &xrefs, (0, 0, 0))
            .unwrap();

        // A junk directory without a snapshot is skipped.
        fs::create_dir_all(dir.path().join("garbage")).unwrap();

        assert_eq!(store.list_progress(), vec![id_a.clone(), id_b.clone()]);

        store.delete_progress(&id_a).unwrap();
        assert!(!store.has_progress(&id_a));
        assert_eq!(store.list_progress(), vec![id_b]);
    }
}

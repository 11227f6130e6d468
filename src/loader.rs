//! NSO container parser and segment loader.
//!
//! Parses the fixed 0x100-byte NSO header, materializes the text/rodata/data
//! segments (LZ4 block decompression where the header flags say so) and
//! resolves virtual-address reads against the three segment ranges.

use std::fmt;
use std::fs;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::{Address, AnalyzerError};

/// NSO magic, "NSO0" in little-endian.
pub const NSO_MAGIC: u32 = 0x304F_534E;

/// Default load base for Switch modules.
pub const DEFAULT_BASE_ADDRESS: Address = 0x71_0000_0000;

const HEADER_SIZE: usize = 0x100;

/// File/memory extent of one segment as declared in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NsoSegmentHeader {
    pub file_offset: u32,
    pub mem_offset: u32,
    pub size: u32,
}

/// Extent relative to the start of rodata (api_info / dynstr / dynsym).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RodataRelativeExtent {
    pub offset: u32,
    pub size: u32,
}

/// Parsed NSO header, fixed little-endian layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsoHeader {
    pub magic: u32,
    pub version: u32,
    pub flags: u32,
    pub text: NsoSegmentHeader,
    pub module_name_offset: u32,
    pub rodata: NsoSegmentHeader,
    pub module_name_size: u32,
    pub data: NsoSegmentHeader,
    pub bss_size: u32,
    pub build_id: [u8; 32],
    pub text_compressed_size: u32,
    pub rodata_compressed_size: u32,
    pub data_compressed_size: u32,
    pub api_info: RodataRelativeExtent,
    pub dynstr: RodataRelativeExtent,
    pub dynsym: RodataRelativeExtent,
    pub text_hash: [u8; 32],
    pub rodata_hash: [u8; 32],
    pub data_hash: [u8; 32],
}

impl NsoHeader {
    /// Compression flag bits: 0 = text, 1 = rodata, 2 = data.
    pub fn text_compressed(&self) -> bool {
        self.flags & 1 != 0
    }
    pub fn rodata_compressed(&self) -> bool {
        self.flags & 2 != 0
    }
    pub fn data_compressed(&self) -> bool {
        self.flags & 4 != 0
    }

    /// Parse the header from the first 0x100 bytes of an NSO image.
    pub fn parse(bytes: &[u8]) -> Result<Self, AnalyzerError> {
        if bytes.len() < HEADER_SIZE {
            return Err(AnalyzerError::Format(format!(
                "file too small for NSO header ({} bytes)",
                bytes.len()
            )));
        }

        let mut r = Cursor::new(bytes);
        let magic = r.read_u32::<LE>()?;
        if magic != NSO_MAGIC {
            return Err(AnalyzerError::Format(format!(
                "bad NSO magic 0x{:08x}",
                magic
            )));
        }

        let version = r.read_u32::<LE>()?;
        let _reserved = r.read_u32::<LE>()?;
        let flags = r.read_u32::<LE>()?;

        let text = Self::read_segment_header(&mut r)?;
        let module_name_offset = r.read_u32::<LE>()?;
        let rodata = Self::read_segment_header(&mut r)?;
        let module_name_size = r.read_u32::<LE>()?;
        let data = Self::read_segment_header(&mut r)?;
        let bss_size = r.read_u32::<LE>()?;

        let mut build_id = [0u8; 32];
        r.read_exact(&mut build_id)?;

        let text_compressed_size = r.read_u32::<LE>()?;
        let rodata_compressed_size = r.read_u32::<LE>()?;
        let data_compressed_size = r.read_u32::<LE>()?;

        let mut reserved2 = [0u8; 28];
        r.read_exact(&mut reserved2)?;

        let api_info = Self::read_extent(&mut r)?;
        let dynstr = Self::read_extent(&mut r)?;
        let dynsym = Self::read_extent(&mut r)?;

        let mut text_hash = [0u8; 32];
        let mut rodata_hash = [0u8; 32];
        let mut data_hash = [0u8; 32];
        r.read_exact(&mut text_hash)?;
        r.read_exact(&mut rodata_hash)?;
        r.read_exact(&mut data_hash)?;

        Ok(NsoHeader {
            magic,
            version,
            flags,
            text,
            module_name_offset,
            rodata,
            module_name_size,
            data,
            bss_size,
            build_id,
            text_compressed_size,
            rodata_compressed_size,
            data_compressed_size,
            api_info,
            dynstr,
            dynsym,
            text_hash,
            rodata_hash,
            data_hash,
        })
    }

    /// Serialize the header back to its 0x100-byte on-disk form.
    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LE>(self.magic)?;
        w.write_u32::<LE>(self.version)?;
        w.write_u32::<LE>(0)?; // reserved
        w.write_u32::<LE>(self.flags)?;

        Self::write_segment_header(w, &self.text)?;
        w.write_u32::<LE>(self.module_name_offset)?;
        Self::write_segment_header(w, &self.rodata)?;
        w.write_u32::<LE>(self.module_name_size)?;
        Self::write_segment_header(w, &self.data)?;
        w.write_u32::<LE>(self.bss_size)?;

        w.write_all(&self.build_id)?;

        w.write_u32::<LE>(self.text_compressed_size)?;
        w.write_u32::<LE>(self.rodata_compressed_size)?;
        w.write_u32::<LE>(self.data_compressed_size)?;

        w.write_all(&[0u8; 28])?; // reserved

        for extent in [&self.api_info, &self.dynstr, &self.dynsym] {
            w.write_u32::<LE>(extent.offset)?;
            w.write_u32::<LE>(extent.size)?;
        }

        w.write_all(&self.text_hash)?;
        w.write_all(&self.rodata_hash)?;
        w.write_all(&self.data_hash)?;
        Ok(())
    }

    fn read_segment_header(r: &mut Cursor<&[u8]>) -> io::Result<NsoSegmentHeader> {
        Ok(NsoSegmentHeader {
            file_offset: r.read_u32::<LE>()?,
            mem_offset: r.read_u32::<LE>()?,
            size: r.read_u32::<LE>()?,
        })
    }

    fn read_extent(r: &mut Cursor<&[u8]>) -> io::Result<RodataRelativeExtent> {
        Ok(RodataRelativeExtent {
            offset: r.read_u32::<LE>()?,
            size: r.read_u32::<LE>()?,
        })
    }

    fn write_segment_header<W: Write>(w: &mut W, seg: &NsoSegmentHeader) -> io::Result<()> {
        w.write_u32::<LE>(seg.file_offset)?;
        w.write_u32::<LE>(seg.mem_offset)?;
        w.write_u32::<LE>(seg.size)?;
        Ok(())
    }
}

/// The three loadable segment kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Text,
    Rodata,
    Data,
}

impl SegmentKind {
    pub fn is_executable(&self) -> bool {
        matches!(self, SegmentKind::Text)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, SegmentKind::Data)
    }

    /// Unix-style permission string for display.
    pub fn permissions(&self) -> &'static str {
        match self {
            SegmentKind::Text => "r-x",
            SegmentKind::Rodata => "r--",
            SegmentKind::Data => "rw-",
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentKind::Text => write!(f, "text"),
            SegmentKind::Rodata => write!(f, "rodata"),
            SegmentKind::Data => write!(f, "data"),
        }
    }
}

/// A decompressed, loadable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub kind: SegmentKind,
    /// Offset of this segment from the image base address
    pub mem_offset: u64,
    pub data: Vec<u8>,
}

impl Segment {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Half-open memory-offset interval occupied by this segment.
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.mem_offset && offset < self.mem_offset + self.size()
    }
}

/// A fully loaded NSO image: header plus the three decompressed segments.
#[derive(Debug, Clone)]
pub struct NsoImage {
    header: NsoHeader,
    text: Segment,
    rodata: Segment,
    data: Segment,
    base_address: Address,
}

impl NsoImage {
    /// Load and decompress an NSO from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AnalyzerError> {
        let raw = fs::read(path)?;
        Self::parse(&raw)
    }

    /// Parse an NSO from an in-memory buffer.
    pub fn parse(raw: &[u8]) -> Result<Self, AnalyzerError> {
        let header = NsoHeader::parse(raw)?;

        let text = Self::load_segment(
            raw,
            SegmentKind::Text,
            &header.text,
            header.text_compressed(),
            header.text_compressed_size,
        )?;
        let rodata = Self::load_segment(
            raw,
            SegmentKind::Rodata,
            &header.rodata,
            header.rodata_compressed(),
            header.rodata_compressed_size,
        )?;
        let data = Self::load_segment(
            raw,
            SegmentKind::Data,
            &header.data,
            header.data_compressed(),
            header.data_compressed_size,
        )?;

        log::debug!(
            "loaded NSO: text {:#x}, rodata {:#x}, data {:#x}, bss {:#x}",
            text.size(),
            rodata.size(),
            data.size(),
            header.bss_size
        );

        Ok(NsoImage {
            header,
            text,
            rodata,
            data,
            base_address: DEFAULT_BASE_ADDRESS,
        })
    }

    fn load_segment(
        raw: &[u8],
        kind: SegmentKind,
        seg: &NsoSegmentHeader,
        compressed: bool,
        compressed_size: u32,
    ) -> Result<Segment, AnalyzerError> {
        let mem_size = seg.size as usize;
        if mem_size == 0 {
            return Ok(Segment {
                kind,
                mem_offset: seg.mem_offset as u64,
                data: Vec::new(),
            });
        }

        let file_size = if compressed {
            compressed_size as usize
        } else {
            mem_size
        };
        let start = seg.file_offset as usize;
        let file_bytes = raw
            .get(start..start + file_size)
            .ok_or_else(|| {
                AnalyzerError::Format(format!(
                    "{} segment extends past end of file (offset 0x{:x}, size 0x{:x})",
                    kind, start, file_size
                ))
            })?;

        let data = if compressed {
            let out = lz4::block::decompress(file_bytes, Some(mem_size as i32))
                .map_err(|e| {
                    AnalyzerError::Format(format!("{} segment decompression failed: {}", kind, e))
                })?;
            if out.len() != mem_size {
                return Err(AnalyzerError::Format(format!(
                    "{} segment decompressed to {} bytes, header declares {}",
                    kind,
                    out.len(),
                    mem_size
                )));
            }
            out
        } else {
            file_bytes.to_vec()
        };

        Ok(Segment {
            kind,
            mem_offset: seg.mem_offset as u64,
            data,
        })
    }

    pub fn header(&self) -> &NsoHeader {
        &self.header
    }

    pub fn text(&self) -> &Segment {
        &self.text
    }

    pub fn rodata(&self) -> &Segment {
        &self.rodata
    }

    pub fn data(&self) -> &Segment {
        &self.data
    }

    pub fn base_address(&self) -> Address {
        self.base_address
    }

    pub fn set_base_address(&mut self, base: Address) {
        self.base_address = base;
    }

    /// Build ID as 64 uppercase hex characters.
    pub fn build_id(&self) -> String {
        let mut s = String::with_capacity(64);
        for b in &self.header.build_id {
            s.push_str(&format!("{:02X}", b));
        }
        s
    }

    /// Segment containing `vaddr`, if any.
    pub fn segment_at(&self, vaddr: Address) -> Option<&Segment> {
        let offset = vaddr.wrapping_sub(self.base_address);
        [&self.text, &self.rodata, &self.data]
            .into_iter()
            .find(|seg| seg.contains_offset(offset))
    }

    /// Read `size` bytes at a virtual address. Fails unless the whole range
    /// lies within a single segment.
    pub fn read_memory(&self, vaddr: Address, size: usize) -> Result<&[u8], AnalyzerError> {
        let seg = self
            .segment_at(vaddr)
            .ok_or(AnalyzerError::AddressOutOfRange(vaddr))?;
        let seg_offset = (vaddr - self.base_address - seg.mem_offset) as usize;
        seg.data
            .get(seg_offset..seg_offset + size)
            .ok_or(AnalyzerError::AddressOutOfRange(vaddr))
    }

    /// Combined in-memory footprint: the three segments plus bss.
    pub fn total_size(&self) -> u64 {
        self.text.size() + self.rodata.size() + self.data.size() + self.header.bss_size as u64
    }
}

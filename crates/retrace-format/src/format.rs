//! On-disk layout constants and fixed-size records of the trace container.
//!
//! All integers are little-endian:
//!
//! ```text
//! header: "RETRACE\0" | header_size u32 | format_version u32 | api_version u32 | flags u32
//!         | meta_len u32 | reserved u32 | meta JSON
//! chunk:  "CHNK" | compression u8 | reserved u8 | reserved u16 | compressed_len u32
//!         | decompressed_len u32 | entry_count u32 | first_ordinal u64 | xxh3 u64 | data
//! toc:    "RTOC" | chunk_count u32 | { offset u64, first_ordinal u64, entry_count u32, reserved u32 }*
//! footer: "RTFOOTER" | toc_offset u64
//! ```

use std::collections::BTreeMap;
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::io::{ReadLeExt, WriteLeExt};

pub const TRACE_MAGIC: [u8; 8] = *b"RETRACE\0";
pub const TRACE_HEADER_SIZE: u32 = 32;
pub const FORMAT_VERSION: u32 = 1;

pub const CHUNK_TAG: [u8; 4] = *b"CHNK";
/// Chunk header size including the tag.
pub const CHUNK_HEADER_SIZE: u32 = 36;

pub const TOC_TAG: [u8; 4] = *b"RTOC";
pub const TOC_ENTRY_SIZE: u32 = 24;

pub const FOOTER_MAGIC: [u8; 8] = *b"RTFOOTER";
pub const TRACE_FOOTER_SIZE: u32 = 16;

/// Upper bound for both the compressed and decompressed size of one chunk.
pub const MAX_CHUNK_SIZE: u32 = 64 * 1024 * 1024;
pub const MAX_META_LEN: u32 = 1024 * 1024;

/// `VK_API_VERSION_1_3`.
pub const DEFAULT_API_VERSION: u32 = (1 << 22) | (3 << 12);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    Lz4 = 1,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            _ => None,
        }
    }

    pub(crate) fn compress(self, input: &[u8]) -> Vec<u8> {
        match self {
            Compression::None => input.to_vec(),
            Compression::Lz4 => lz4_flex::block::compress(input),
        }
    }

    pub(crate) fn decompress(self, compressed: &[u8], expected_len: usize) -> Result<Vec<u8>, String> {
        match self {
            Compression::None => {
                if compressed.len() != expected_len {
                    return Err(format!(
                        "stored chunk holds {} bytes, header declares {expected_len}",
                        compressed.len()
                    ));
                }
                Ok(compressed.to_vec())
            }
            Compression::Lz4 => {
                let out = lz4_flex::block::decompress(compressed, expected_len)
                    .map_err(|err| format!("lz4 decompression failed: {err}"))?;
                if out.len() != expected_len {
                    return Err(format!(
                        "decompressed to {} bytes, header declares {expected_len}",
                        out.len()
                    ));
                }
                Ok(out)
            }
        }
    }
}

/// Free-form capture metadata stored as JSON after the fixed header.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_unix_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    pub format_version: u32,
    pub api_version: u32,
    pub flags: u32,
    pub meta_len: u32,
}

impl TraceHeader {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&TRACE_MAGIC)?;
        w.write_u32_le(TRACE_HEADER_SIZE)?;
        w.write_u32_le(self.format_version)?;
        w.write_u32_le(self.api_version)?;
        w.write_u32_le(self.flags)?;
        w.write_u32_le(self.meta_len)?;
        w.write_u32_le(0) // reserved
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub compression: Compression,
    pub compressed_len: u32,
    pub decompressed_len: u32,
    pub entry_count: u32,
    pub first_ordinal: u64,
    /// XXH3-64 of the decompressed bytes.
    pub checksum: u64,
}

impl ChunkHeader {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(&CHUNK_TAG)?;
        w.write_u8(self.compression as u8)?;
        w.write_u8(0)?;
        w.write_u16_le(0)?;
        w.write_u32_le(self.compressed_len)?;
        w.write_u32_le(self.decompressed_len)?;
        w.write_u32_le(self.entry_count)?;
        w.write_u64_le(self.first_ordinal)?;
        w.write_u64_le(self.checksum)
    }

    /// Reads the fields that follow the tag. The compression byte is returned raw so that the
    /// caller can report an unknown value with its own context.
    pub(crate) fn read_body<R: Read>(r: &mut R) -> io::Result<(u8, RawChunkFields)> {
        let compression = r.read_u8()?;
        let _reserved = r.read_u8()?;
        let _reserved = r.read_u16_le()?;
        Ok((
            compression,
            RawChunkFields {
                compressed_len: r.read_u32_le()?,
                decompressed_len: r.read_u32_le()?,
                entry_count: r.read_u32_le()?,
                first_ordinal: r.read_u64_le()?,
                checksum: r.read_u64_le()?,
            },
        ))
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RawChunkFields {
    pub(crate) compressed_len: u32,
    pub(crate) decompressed_len: u32,
    pub(crate) entry_count: u32,
    pub(crate) first_ordinal: u64,
    pub(crate) checksum: u64,
}

/// One chunk index record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TocEntry {
    /// File offset of the chunk tag.
    pub offset: u64,
    pub first_ordinal: u64,
    pub entry_count: u32,
}

impl TocEntry {
    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u64_le(self.offset)?;
        w.write_u64_le(self.first_ordinal)?;
        w.write_u32_le(self.entry_count)?;
        w.write_u32_le(0)
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let offset = r.read_u64_le()?;
        let first_ordinal = r.read_u64_le()?;
        let entry_count = r.read_u32_le()?;
        let _reserved = r.read_u32_le()?;
        Ok(Self {
            offset,
            first_ordinal,
            entry_count,
        })
    }
}

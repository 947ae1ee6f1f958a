use std::io::Write;

use tracing::debug;

use crate::codec::{self, CodecError};
use crate::descriptor::DescriptorTable;
use crate::entry::DecodedCall;
use crate::error::TraceError;
use crate::format::{
    ChunkHeader, Compression, TocEntry, TraceHeader, TraceMeta, CHUNK_HEADER_SIZE,
    DEFAULT_API_VERSION, FOOTER_MAGIC, FORMAT_VERSION, MAX_CHUNK_SIZE, MAX_META_LEN,
    TOC_ENTRY_SIZE, TOC_TAG, TRACE_HEADER_SIZE,
};
use crate::io::WriteLeExt;

#[derive(Clone, Debug, PartialEq)]
pub struct WriterOptions {
    pub compression: Compression,
    /// A chunk is closed once its decompressed size would exceed this.
    pub max_chunk_bytes: usize,
    pub max_chunk_entries: u32,
    pub api_version: u32,
    pub flags: u32,
    pub meta: TraceMeta,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Lz4,
            max_chunk_bytes: 1024 * 1024,
            max_chunk_entries: 4096,
            api_version: DEFAULT_API_VERSION,
            flags: 0,
            meta: TraceMeta::default(),
        }
    }
}

/// Streams encoded entries into chunks. Call [`TraceWriter::finish`] to write the chunk index;
/// a trace whose writer is dropped early is readable up to its last complete chunk only with
/// [`ReaderOptions::allow_unfinalized`](crate::ReaderOptions::allow_unfinalized).
pub struct TraceWriter<W: Write> {
    out: W,
    compression: Compression,
    max_chunk_bytes: usize,
    max_chunk_entries: u32,
    pos: u64,
    chunk: Vec<u8>,
    chunk_entries: u32,
    chunk_first_ordinal: u64,
    last_ordinal: Option<u64>,
    toc: Vec<TocEntry>,
    entries_written: u64,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut out: W, options: WriterOptions) -> Result<Self, TraceError> {
        if options.max_chunk_bytes == 0 || options.max_chunk_bytes > MAX_CHUNK_SIZE as usize {
            return Err(TraceError::InvalidOptions("max_chunk_bytes out of range"));
        }
        if options.max_chunk_entries == 0 {
            return Err(TraceError::InvalidOptions("max_chunk_entries must be non-zero"));
        }

        let meta = serde_json::to_vec(&options.meta)
            .map_err(|err| TraceError::InvalidMeta(err.to_string()))?;
        let meta_len = u32::try_from(meta.len())
            .ok()
            .filter(|len| *len <= MAX_META_LEN)
            .ok_or(TraceError::InvalidOptions("metadata too large"))?;

        TraceHeader {
            format_version: FORMAT_VERSION,
            api_version: options.api_version,
            flags: options.flags,
            meta_len,
        }
        .write_to(&mut out)?;
        out.write_all(&meta)?;

        Ok(Self {
            out,
            compression: options.compression,
            max_chunk_bytes: options.max_chunk_bytes,
            max_chunk_entries: options.max_chunk_entries,
            pos: u64::from(TRACE_HEADER_SIZE) + u64::from(meta_len),
            chunk: Vec::new(),
            chunk_entries: 0,
            chunk_first_ordinal: 0,
            last_ordinal: None,
            toc: Vec::new(),
            entries_written: 0,
        })
    }

    /// Appends one call. Ordinals must strictly increase.
    pub fn append(&mut self, call: &DecodedCall) -> Result<(), TraceError> {
        let bytes = codec::encode(call)?;
        self.append_encoded(call.header.ordinal, &bytes)
    }

    pub(crate) fn append_encoded(&mut self, ordinal: u64, bytes: &[u8]) -> Result<(), TraceError> {
        if let Some(previous) = self.last_ordinal {
            if ordinal <= previous {
                return Err(TraceError::OrdinalRegression {
                    chunk_index: self.toc.len() as u64,
                    previous,
                    ordinal,
                });
            }
        }
        if bytes.len() > MAX_CHUNK_SIZE as usize {
            return Err(CodecError::TooLarge {
                what: "entry",
                len: bytes.len(),
            }
            .into());
        }
        if self.chunk_entries > 0 && self.chunk.len() + bytes.len() > self.max_chunk_bytes {
            self.flush_chunk()?;
        }

        if self.chunk_entries == 0 {
            self.chunk_first_ordinal = ordinal;
        }
        self.chunk.extend_from_slice(bytes);
        self.chunk_entries += 1;
        self.entries_written += 1;
        self.last_ordinal = Some(ordinal);

        if self.chunk_entries >= self.max_chunk_entries || self.chunk.len() >= self.max_chunk_bytes
        {
            self.flush_chunk()?;
        }
        Ok(())
    }

    /// Closes the open chunk, if any, and writes it out.
    pub fn flush_chunk(&mut self) -> Result<(), TraceError> {
        if self.chunk_entries == 0 {
            return Ok(());
        }
        // A chunk that does not shrink is stored raw, which also keeps it under the size limit.
        let compressed = match self.compression {
            Compression::None => None,
            compression => Some(compression.compress(&self.chunk))
                .filter(|compressed| compressed.len() < self.chunk.len()),
        };
        let (compression, payload) = match &compressed {
            Some(compressed) => (self.compression, compressed.as_slice()),
            None => (Compression::None, self.chunk.as_slice()),
        };
        let compressed_len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len <= MAX_CHUNK_SIZE)
            .ok_or(CodecError::TooLarge {
                what: "chunk",
                len: payload.len(),
            })?;
        let header = ChunkHeader {
            compression,
            compressed_len,
            decompressed_len: self.chunk.len() as u32,
            entry_count: self.chunk_entries,
            first_ordinal: self.chunk_first_ordinal,
            checksum: xxhash_rust::xxh3::xxh3_64(&self.chunk),
        };
        header.write_to(&mut self.out)?;
        self.out.write_all(payload)?;

        debug!(
            chunk_index = self.toc.len(),
            entries = self.chunk_entries,
            bytes = self.chunk.len(),
            stored = payload.len(),
            ?compression,
            "wrote trace chunk"
        );
        self.toc.push(TocEntry {
            offset: self.pos,
            first_ordinal: self.chunk_first_ordinal,
            entry_count: self.chunk_entries,
        });
        self.pos += u64::from(CHUNK_HEADER_SIZE) + u64::from(compressed_len);
        self.chunk.clear();
        self.chunk_entries = 0;
        Ok(())
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn chunks_written(&self) -> usize {
        self.toc.len()
    }

    /// Flushes the open chunk, writes the chunk index and footer, and returns the sink.
    pub fn finish(mut self) -> Result<W, TraceError> {
        self.flush_chunk()?;

        let toc_offset = self.pos;
        let count = u32::try_from(self.toc.len())
            .map_err(|_| TraceError::InvalidOptions("too many chunks for the index"))?;
        self.out.write_all(&TOC_TAG)?;
        self.out.write_u32_le(count)?;
        for entry in &self.toc {
            entry.write_to(&mut self.out)?;
        }
        self.out.write_all(&FOOTER_MAGIC)?;
        self.out.write_u64_le(toc_offset)?;
        self.out.flush()?;

        debug!(
            chunks = count,
            entries = self.entries_written,
            index_bytes = 8 + u64::from(count) * u64::from(TOC_ENTRY_SIZE),
            "finished trace"
        );
        Ok(self.out)
    }
}

/// Capture-side front end: numbers calls, validates them against the descriptor table and
/// appends them to a [`TraceWriter`].
pub struct Recorder<'t, W: Write> {
    writer: TraceWriter<W>,
    table: &'t DescriptorTable,
    next_ordinal: u64,
}

impl<'t, W: Write> Recorder<'t, W> {
    pub fn new(writer: TraceWriter<W>, table: &'t DescriptorTable) -> Self {
        Self {
            writer,
            table,
            next_ordinal: 1,
        }
    }

    /// Records `call`, overwriting its ordinal, and returns the ordinal assigned.
    pub fn record(&mut self, mut call: DecodedCall) -> Result<u64, TraceError> {
        let ordinal = self.next_ordinal;
        call.header.ordinal = ordinal;
        let bytes = codec::encode_call_checked(&call, self.table)?;
        self.writer.append_encoded(ordinal, &bytes)?;
        self.next_ordinal += 1;
        Ok(ordinal)
    }

    pub fn writer(&self) -> &TraceWriter<W> {
        &self.writer
    }

    pub fn finish(self) -> Result<W, TraceError> {
        self.writer.finish()
    }
}

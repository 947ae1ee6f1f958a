use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use crate::codec::{self, CodecError};
use crate::entry::Entry;
use crate::error::{truncated, TraceError};
use crate::format::{
    ChunkHeader, Compression, TocEntry, TraceHeader, TraceMeta, CHUNK_TAG, FOOTER_MAGIC,
    FORMAT_VERSION, MAX_CHUNK_SIZE, MAX_META_LEN, TOC_ENTRY_SIZE, TOC_TAG, TRACE_FOOTER_SIZE,
    TRACE_HEADER_SIZE, TRACE_MAGIC,
};
use crate::io::{ByteCursor, ReadLeExt};

/// Where an entry was found, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryLocation {
    pub chunk_index: u64,
    /// File offset of the chunk tag.
    pub chunk_offset: u64,
    /// Offset of the entry within the decompressed chunk.
    pub entry_offset: u32,
}

impl fmt::Display for EntryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chunk {} (file offset {}), entry offset {}",
            self.chunk_index, self.chunk_offset, self.entry_offset
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatedEntry {
    pub entry: Entry,
    pub location: EntryLocation,
}

/// Tracks the absolute stream position so that errors can name byte offsets without `Seek`.
struct Tracked<R> {
    inner: R,
    pos: u64,
}

impl<R: Read> Read for Tracked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

struct OpenChunk {
    index: u64,
    offset: u64,
    first_ordinal: u64,
    entry_count: u32,
    entries_read: u32,
    data: Vec<u8>,
    pos: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Accept a trace that stops at a chunk boundary without its chunk index, as a capture that
    /// was never finalized leaves it. By default such a trace is reported as truncated.
    pub allow_unfinalized: bool,
}

/// Sequential reader over a trace, with optional seeking when the chunk index is present.
///
/// Once the index is loaded, every chunk read is checked against its index record.
///
/// Chunks are decompressed on demand and each buffer is dropped once its last entry has been
/// returned.
pub struct TraceReader<R> {
    input: Tracked<R>,
    header: TraceHeader,
    meta: TraceMeta,
    data_start: u64,
    toc: Option<Vec<TocEntry>>,
    next_chunk_index: u64,
    current: Option<OpenChunk>,
    pending: Option<LocatedEntry>,
    last_ordinal: Option<u64>,
    finished: bool,
    options: ReaderOptions,
}

impl TraceReader<BufReader<File>> {
    /// Opens a trace file and loads its chunk index if one was written.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Self::open_with(path, ReaderOptions::default())
    }

    pub fn open_with(path: impl AsRef<Path>, options: ReaderOptions) -> Result<Self, TraceError> {
        let file = File::open(path.as_ref())?;
        let mut reader = TraceReader::with_options(BufReader::new(file), options)?;
        reader.load_toc()?;
        Ok(reader)
    }
}

impl<R: Read> TraceReader<R> {
    /// Validates the header and reads the metadata block. No chunk is touched.
    pub fn new(reader: R) -> Result<Self, TraceError> {
        Self::with_options(reader, ReaderOptions::default())
    }

    pub fn with_options(reader: R, options: ReaderOptions) -> Result<Self, TraceError> {
        let mut input = Tracked {
            inner: reader,
            pos: 0,
        };
        let header = read_header(&mut input)?;

        let meta_bytes = input
            .read_exact_vec(header.meta_len as usize)
            .map_err(|err| truncated(err, u64::from(TRACE_HEADER_SIZE), "trace metadata"))?;
        let meta = if meta_bytes.is_empty() {
            TraceMeta::default()
        } else {
            serde_json::from_slice(&meta_bytes)
                .map_err(|err| TraceError::InvalidMeta(err.to_string()))?
        };
        let data_start = input.pos;

        Ok(Self {
            input,
            header,
            meta,
            data_start,
            toc: None,
            next_chunk_index: 0,
            current: None,
            pending: None,
            last_ordinal: None,
            finished: false,
            options,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    pub fn meta(&self) -> &TraceMeta {
        &self.meta
    }

    /// The chunk index, if it has been loaded.
    pub fn toc(&self) -> Option<&[TocEntry]> {
        self.toc.as_deref()
    }

    /// Number of chunks opened so far.
    pub fn chunks_read(&self) -> u64 {
        self.next_chunk_index
    }

    /// Returns the next entry in ordinal order, or `None` at the end of the chunk stream.
    ///
    /// After an error the reader stays at end of stream.
    pub fn next_entry(&mut self) -> Result<Option<LocatedEntry>, TraceError> {
        if let Some(entry) = self.pending.take() {
            return Ok(Some(entry));
        }
        let result = self.read_next();
        if result.is_err() {
            self.finished = true;
            self.current = None;
        }
        result
    }

    pub fn entries(&mut self) -> Entries<'_, R> {
        Entries { reader: self }
    }

    fn read_next(&mut self) -> Result<Option<LocatedEntry>, TraceError> {
        loop {
            if self.finished {
                return Ok(None);
            }
            if let Some(chunk) = self.current.as_mut() {
                if chunk.pos < chunk.data.len() {
                    let located = take_entry(chunk, self.last_ordinal)?;
                    self.last_ordinal = Some(located.entry.header.ordinal);
                    return Ok(Some(located));
                }
                if chunk.entries_read != chunk.entry_count {
                    return Err(TraceError::ChunkCorrupt {
                        chunk_index: chunk.index,
                        offset: chunk.offset,
                        reason: format!(
                            "holds {} entries, header declares {}",
                            chunk.entries_read, chunk.entry_count
                        ),
                    });
                }
                self.current = None;
            }
            match self.read_chunk()? {
                Some(chunk) => self.current = Some(chunk),
                None => self.finished = true,
            }
        }
    }

    fn read_chunk(&mut self) -> Result<Option<OpenChunk>, TraceError> {
        let offset = self.input.pos;
        let chunk_index = self.next_chunk_index;
        let corrupt = |reason: String| TraceError::ChunkCorrupt {
            chunk_index,
            offset,
            reason,
        };

        let mut tag = [0u8; 4];
        match read_fully(&mut self.input, &mut tag)? {
            0 if self.options.allow_unfinalized => {
                warn!(
                    offset,
                    chunks = chunk_index,
                    "trace ends without a chunk index; the capture was not finalized"
                );
                return Ok(None);
            }
            0 => {
                return Err(TraceError::Truncated {
                    offset,
                    what: "chunk index",
                })
            }
            4 => {}
            _ => {
                return Err(TraceError::Truncated {
                    offset,
                    what: "chunk tag",
                })
            }
        }
        if tag == TOC_TAG {
            if let Some(toc) = &self.toc {
                if toc.len() as u64 != chunk_index {
                    return Err(TraceError::CorruptToc(format!(
                        "index lists {} chunks, the stream holds {chunk_index}",
                        toc.len()
                    )));
                }
            }
            return Ok(None);
        }
        if tag != CHUNK_TAG {
            return Err(corrupt(format!("unexpected tag {tag:02x?}")));
        }

        let (compression, fields) = ChunkHeader::read_body(&mut self.input)
            .map_err(|err| truncated(err, offset, "chunk header"))?;
        let compression = Compression::from_u8(compression)
            .ok_or_else(|| corrupt(format!("unknown compression kind {compression}")))?;
        if fields.compressed_len > MAX_CHUNK_SIZE || fields.decompressed_len > MAX_CHUNK_SIZE {
            return Err(corrupt(format!(
                "chunk size {}/{} exceeds the {MAX_CHUNK_SIZE} byte limit",
                fields.compressed_len, fields.decompressed_len
            )));
        }
        if fields.entry_count == 0 {
            return Err(corrupt("empty chunk".to_owned()));
        }
        if let Some(toc) = &self.toc {
            let listed = toc.get(chunk_index as usize).ok_or_else(|| {
                corrupt(format!("missing from the chunk index ({} records)", toc.len()))
            })?;
            if listed.offset != offset
                || listed.first_ordinal != fields.first_ordinal
                || listed.entry_count != fields.entry_count
            {
                return Err(corrupt(format!(
                    "index records byte {} with {} entries from ordinal {}, chunk holds {} \
                     entries from ordinal {}",
                    listed.offset,
                    listed.entry_count,
                    listed.first_ordinal,
                    fields.entry_count,
                    fields.first_ordinal
                )));
            }
        }
        if let Some(previous) = self.last_ordinal {
            if fields.first_ordinal <= previous {
                return Err(TraceError::OrdinalRegression {
                    chunk_index,
                    previous,
                    ordinal: fields.first_ordinal,
                });
            }
        }

        let compressed = self
            .input
            .read_exact_vec(fields.compressed_len as usize)
            .map_err(|err| truncated(err, offset, "chunk data"))?;
        let data = compression
            .decompress(&compressed, fields.decompressed_len as usize)
            .map_err(corrupt)?;
        let checksum = xxhash_rust::xxh3::xxh3_64(&data);
        if checksum != fields.checksum {
            return Err(corrupt(format!(
                "checksum mismatch (stored {:016x}, computed {checksum:016x})",
                fields.checksum
            )));
        }

        debug!(
            chunk_index,
            offset,
            entries = fields.entry_count,
            bytes = data.len(),
            "opened trace chunk"
        );
        self.next_chunk_index += 1;
        Ok(Some(OpenChunk {
            index: chunk_index,
            offset,
            first_ordinal: fields.first_ordinal,
            entry_count: fields.entry_count,
            entries_read: 0,
            data,
            pos: 0,
        }))
    }
}

fn take_entry(chunk: &mut OpenChunk, last_ordinal: Option<u64>) -> Result<LocatedEntry, TraceError> {
    let corrupt = |reason: String| TraceError::ChunkCorrupt {
        chunk_index: chunk.index,
        offset: chunk.offset,
        reason,
    };
    if chunk.entries_read == chunk.entry_count {
        return Err(corrupt(format!(
            "{} bytes after the last declared entry",
            chunk.data.len() - chunk.pos
        )));
    }

    let entry_offset = chunk.pos;
    let mut cursor = ByteCursor::new(&chunk.data[entry_offset..]);
    let entry = codec::read_entry(&mut cursor).map_err(|err| match err {
        CodecError::Truncated { .. } => {
            corrupt(format!("entry at offset {entry_offset} overruns the chunk: {err}"))
        }
        other => TraceError::Codec(other),
    })?;

    let ordinal = entry.header.ordinal;
    if chunk.entries_read == 0 && ordinal != chunk.first_ordinal {
        return Err(corrupt(format!(
            "first entry has ordinal {ordinal}, header declares {}",
            chunk.first_ordinal
        )));
    }
    if let Some(previous) = last_ordinal {
        if ordinal <= previous {
            return Err(TraceError::OrdinalRegression {
                chunk_index: chunk.index,
                previous,
                ordinal,
            });
        }
    }

    chunk.pos += cursor.position();
    chunk.entries_read += 1;
    Ok(LocatedEntry {
        entry,
        location: EntryLocation {
            chunk_index: chunk.index,
            chunk_offset: chunk.offset,
            entry_offset: entry_offset as u32,
        },
    })
}

impl<R: Read + Seek> TraceReader<R> {
    /// Loads the chunk index from the footer. Returns `false` when the trace has none (the
    /// capture was not finalized); the read position is left unchanged either way.
    pub fn load_toc(&mut self) -> Result<bool, TraceError> {
        let resume = self.input.pos;
        let toc = self.read_toc();
        self.input.inner.seek(SeekFrom::Start(resume))?;
        match toc? {
            Some(toc) => {
                debug!(chunks = toc.len(), "loaded trace chunk index");
                self.toc = Some(toc);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn read_toc(&mut self) -> Result<Option<Vec<TocEntry>>, TraceError> {
        let r = &mut self.input.inner;
        let file_len = r.seek(SeekFrom::End(0))?;
        let footer_size = u64::from(TRACE_FOOTER_SIZE);
        if file_len < self.data_start + footer_size {
            return Ok(None);
        }
        let footer_start = file_len - footer_size;
        r.seek(SeekFrom::Start(footer_start))?;
        let mut magic = [0u8; 8];
        r.read_exact(&mut magic)?;
        if magic != FOOTER_MAGIC {
            return Ok(None);
        }
        let toc_offset = r.read_u64_le()?;
        if toc_offset < self.data_start || toc_offset.saturating_add(8) > footer_start {
            return Err(TraceError::CorruptToc(format!(
                "index offset {toc_offset} is outside the chunk region"
            )));
        }

        r.seek(SeekFrom::Start(toc_offset))?;
        let mut tag = [0u8; 4];
        r.read_exact(&mut tag)?;
        if tag != TOC_TAG {
            return Err(TraceError::CorruptToc(format!("unexpected tag {tag:02x?}")));
        }
        let count = r.read_u32_le()?;
        let expected_end = toc_offset + 8 + u64::from(count) * u64::from(TOC_ENTRY_SIZE);
        if expected_end != footer_start {
            return Err(TraceError::CorruptToc(format!(
                "{count} records do not fit between byte {toc_offset} and the footer"
            )));
        }

        let mut entries: Vec<TocEntry> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry = TocEntry::read_from(&mut *r)?;
            if entry.offset < self.data_start || entry.offset >= toc_offset || entry.entry_count == 0
            {
                return Err(TraceError::CorruptToc(format!(
                    "record for chunk at byte {} is out of bounds",
                    entry.offset
                )));
            }
            if let Some(prev) = entries.last() {
                if entry.offset <= prev.offset || entry.first_ordinal <= prev.first_ordinal {
                    return Err(TraceError::CorruptToc(
                        "records are not in ascending order".to_owned(),
                    ));
                }
            }
            entries.push(entry);
        }
        Ok(Some(entries))
    }

    /// Positions the reader so that the next entry returned is the first one whose ordinal is
    /// at least `ordinal`.
    pub fn seek_to_ordinal(&mut self, ordinal: u64) -> Result<(), TraceError> {
        let toc = self.toc.as_ref().ok_or(TraceError::NotSeekable)?;
        let idx = toc.partition_point(|e| e.first_ordinal <= ordinal);
        // Ordinals before the first chunk start at the beginning of the stream.
        let (chunk_index, target) = match idx {
            0 => (0, toc.first().copied()),
            n => (n - 1, Some(toc[n - 1])),
        };
        let Some(target) = target else {
            return Err(TraceError::OrdinalNotFound(ordinal));
        };

        self.input.inner.seek(SeekFrom::Start(target.offset))?;
        self.input.pos = target.offset;
        self.current = None;
        self.pending = None;
        self.last_ordinal = None;
        self.finished = false;
        self.next_chunk_index = chunk_index as u64;

        while let Some(located) = self.next_entry()? {
            if located.entry.header.ordinal >= ordinal {
                self.pending = Some(located);
                return Ok(());
            }
        }
        Err(TraceError::OrdinalNotFound(ordinal))
    }
}

pub struct Entries<'a, R> {
    reader: &'a mut TraceReader<R>,
}

impl<R: Read> Iterator for Entries<'_, R> {
    type Item = Result<LocatedEntry, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_entry().transpose()
    }
}

fn read_header<R: Read>(input: &mut Tracked<R>) -> Result<TraceHeader, TraceError> {
    let mut magic = [0u8; 8];
    input
        .read_exact(&mut magic)
        .map_err(|err| truncated(err, 0, "trace header"))?;
    if magic != TRACE_MAGIC {
        return Err(TraceError::InvalidMagic);
    }

    let header_size = header_u32(input)?;
    if header_size != TRACE_HEADER_SIZE {
        return Err(TraceError::UnsupportedHeaderSize(header_size));
    }
    let format_version = header_u32(input)?;
    if format_version != FORMAT_VERSION {
        return Err(TraceError::UnsupportedVersion(format_version));
    }
    let api_version = header_u32(input)?;
    let flags = header_u32(input)?;
    let meta_len = header_u32(input)?;
    let _reserved = header_u32(input)?;
    if meta_len > MAX_META_LEN {
        return Err(TraceError::InvalidMeta(format!(
            "metadata length {meta_len} exceeds {MAX_META_LEN} bytes"
        )));
    }

    Ok(TraceHeader {
        format_version,
        api_version,
        flags,
        meta_len,
    })
}

fn header_u32<R: Read>(input: &mut Tracked<R>) -> Result<u32, TraceError> {
    let at = input.pos;
    input
        .read_u32_le()
        .map_err(|err| truncated(err, at, "trace header"))
}

/// Like `read_exact`, but returns how many bytes were read before a clean EOF.
fn read_fully<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

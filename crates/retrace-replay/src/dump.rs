//! Read-only inspection of traces: per-entry listings and whole-trace summaries.
//!
//! Everything here goes through the trace reader and the entry codec only. Nothing touches the
//! handle table, the shader cache or a driver.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Read, Write};

use retrace_format::{
    codec, ArgValue, CodecError, DescriptorTable, EntryHeader, LocatedEntry, TraceError,
    TraceMeta, TraceReader, Value,
};
use serde::Serialize;
use serde_json::json;

/// Byte blobs longer than this are abbreviated in listings.
const BYTES_PREVIEW: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("failed to write dump output: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize dump record: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
pub struct DumpArg {
    pub name: String,
    pub value: serde_json::Value,
}

/// One listed entry. `args` is absent when the entry could not be decoded; `error` says why.
#[derive(Debug, Serialize)]
pub struct DumpRecord {
    pub ordinal: u64,
    pub queue: u32,
    pub selector: String,
    pub function: Option<String>,
    pub result: i32,
    pub waits: Vec<u64>,
    pub signals: Vec<u64>,
    pub chunk: u64,
    pub entry_offset: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<DumpArg>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DumpSummary {
    pub entries: u64,
    /// Entries listed raw because their selector or payload did not decode.
    pub undecoded: u64,
}

pub fn value_to_json(value: &ArgValue) -> serde_json::Value {
    match value {
        Value::U8(v) => json!(v),
        Value::U16(v) => json!(v),
        Value::U32(v) => json!(v),
        Value::U64(v) => json!(v),
        Value::I32(v) => json!(v),
        Value::I64(v) => json!(v),
        Value::F32(v) => json!(v),
        Value::F64(v) => json!(v),
        Value::Bytes(bytes) => json!({ "len": bytes.len(), "hex": preview_hex(bytes) }),
        Value::Str(s) => json!(s),
        Value::Handle(ty, h) => json!({ "type": ty.to_string(), "handle": h.to_string() }),
        Value::Optional(None) => serde_json::Value::Null,
        Value::Optional(Some(inner)) => value_to_json(inner),
        Value::Array(items) | Value::Struct(items) => {
            serde_json::Value::Array(items.iter().map(value_to_json).collect())
        }
    }
}

fn preview_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(BYTES_PREVIEW * 2 + 3);
    for byte in bytes.iter().take(BYTES_PREVIEW) {
        let _ = write!(out, "{byte:02x}");
    }
    if bytes.len() > BYTES_PREVIEW {
        out.push_str("...");
    }
    out
}

fn write_value(out: &mut String, value: &ArgValue) {
    match value {
        Value::U8(v) => write_display(out, v),
        Value::U16(v) => write_display(out, v),
        Value::U32(v) => write_display(out, v),
        Value::U64(v) => write_display(out, v),
        Value::I32(v) => write_display(out, v),
        Value::I64(v) => write_display(out, v),
        Value::F32(v) => write_display(out, v),
        Value::F64(v) => write_display(out, v),
        Value::Bytes(bytes) => {
            let _ = write!(out, "<{} bytes {}>", bytes.len(), preview_hex(bytes));
        }
        Value::Str(s) => {
            let _ = write!(out, "{s:?}");
        }
        Value::Handle(ty, h) => {
            let _ = write!(out, "{ty}({h})");
        }
        Value::Optional(None) => out.push_str("null"),
        Value::Optional(Some(inner)) => write_value(out, inner),
        Value::Array(items) => write_list(out, '[', items, ']'),
        Value::Struct(items) => write_list(out, '{', items, '}'),
    }
}

fn write_display(out: &mut String, v: impl std::fmt::Display) {
    let _ = write!(out, "{v}");
}

fn write_list(out: &mut String, open: char, items: &[ArgValue], close: char) {
    out.push(open);
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_value(out, item);
    }
    out.push(close);
}

fn write_tokens(out: &mut String, label: &str, tokens: &[u64]) {
    if tokens.is_empty() {
        return;
    }
    let _ = write!(out, " {label}=");
    for (i, token) in tokens.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{token}");
    }
}

/// Decodes one located entry into a listing record. Never fails: undecodable entries come back
/// with `error` and `raw_payload` set.
pub fn dump_record(located: &LocatedEntry, table: &DescriptorTable) -> DumpRecord {
    let header = &located.entry.header;
    let desc = table.get(header.selector);
    let mut record = DumpRecord {
        ordinal: header.ordinal,
        queue: header.queue,
        selector: header.selector.to_string(),
        function: desc.map(|d| d.name.clone()),
        result: header.result,
        waits: header.waits.clone(),
        signals: header.signals.clone(),
        chunk: located.location.chunk_index,
        entry_offset: located.location.entry_offset,
        args: None,
        error: None,
        raw_payload: None,
    };
    match (desc, codec::decode_entry(&located.entry, table)) {
        (Some(desc), Ok(call)) => {
            record.args = Some(
                desc.params
                    .iter()
                    .zip(&call.args)
                    .map(|(param, value)| DumpArg {
                        name: param.name.clone(),
                        value: value_to_json(value),
                    })
                    .collect(),
            );
        }
        (_, Err(err)) => {
            record.error = Some(err.to_string());
            record.raw_payload = Some(preview_hex(&located.entry.payload));
        }
        (None, Ok(_)) => {
            record.error = Some(
                CodecError::UnknownFunction {
                    selector: header.selector,
                    ordinal: header.ordinal,
                }
                .to_string(),
            );
        }
    }
    record
}

/// One-line human form: `#ordinal q<queue> name(args) = result waits=.. signals=..`.
pub fn describe_call(header: &EntryHeader, name: &str, params: &[(&str, &ArgValue)]) -> String {
    let mut out = String::new();
    let _ = write!(out, "#{} q{} {name}(", header.ordinal, header.queue);
    for (i, (param, value)) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{param}=");
        write_value(&mut out, value);
    }
    let _ = write!(out, ") = {}", header.result);
    write_tokens(&mut out, "waits", &header.waits);
    write_tokens(&mut out, "signals", &header.signals);
    out
}

fn describe_located(located: &LocatedEntry, table: &DescriptorTable) -> (String, bool) {
    let header = &located.entry.header;
    let decoded = table
        .get(header.selector)
        .ok_or(CodecError::UnknownFunction {
            selector: header.selector,
            ordinal: header.ordinal,
        })
        .and_then(|desc| Ok((desc, codec::decode_entry(&located.entry, table)?)));
    match decoded {
        Ok((desc, call)) => {
            let params: Vec<(&str, &ArgValue)> = desc
                .params
                .iter()
                .map(|p| p.name.as_str())
                .zip(&call.args)
                .collect();
            (describe_call(header, &desc.name, &params), true)
        }
        Err(err) => {
            let mut line = format!(
                "#{} q{} <{}> = {} payload=<{} bytes {}>",
                header.ordinal,
                header.queue,
                header.selector,
                header.result,
                located.entry.payload.len(),
                preview_hex(&located.entry.payload)
            );
            write_tokens(&mut line, "waits", &header.waits);
            write_tokens(&mut line, "signals", &header.signals);
            let _ = write!(line, " ! {err}");
            (line, false)
        }
    }
}

/// Lists entries of `reader` to `out`, as text lines or JSON lines, stopping after `limit`
/// entries when given. Entries that do not decode are listed raw; trace-level corruption ends
/// the listing with an error.
pub fn dump_trace<R: Read>(
    reader: &mut TraceReader<R>,
    table: &DescriptorTable,
    out: &mut impl Write,
    json: bool,
    limit: Option<u64>,
) -> Result<DumpSummary, DumpError> {
    let mut summary = DumpSummary::default();
    while limit.map_or(true, |limit| summary.entries < limit) {
        let Some(located) = reader.next_entry()? else {
            break;
        };
        let decoded = if json {
            let record = dump_record(&located, table);
            serde_json::to_writer(&mut *out, &record)?;
            out.write_all(b"\n")?;
            record.error.is_none()
        } else {
            let (line, decoded) = describe_located(&located, table);
            writeln!(out, "{line}")?;
            decoded
        };
        summary.entries += 1;
        if !decoded {
            summary.undecoded += 1;
        }
    }
    out.flush()?;
    Ok(summary)
}

#[derive(Debug, Serialize)]
pub struct TraceInfo {
    pub format_version: u32,
    pub api_version: String,
    pub flags: u32,
    pub meta: TraceMeta,
    /// Whether the trace ends with a chunk index (and therefore supports seeking).
    pub indexed: bool,
    pub chunks: u64,
    pub entries: u64,
    pub first_ordinal: Option<u64>,
    pub last_ordinal: Option<u64>,
    /// Entry count per queue.
    pub queues: BTreeMap<u32, u64>,
}

fn format_api_version(v: u32) -> String {
    format!("{}.{}.{}", v >> 22, (v >> 12) & 0x3ff, v & 0xfff)
}

/// Scans the whole trace and summarizes it.
pub fn trace_info<R: Read>(reader: &mut TraceReader<R>) -> Result<TraceInfo, TraceError> {
    let header = *reader.header();
    let meta = reader.meta().clone();
    let indexed = reader.toc().is_some();

    let mut entries = 0u64;
    let mut first_ordinal = None;
    let mut last_ordinal = None;
    let mut queues = BTreeMap::new();
    while let Some(located) = reader.next_entry()? {
        let header = &located.entry.header;
        entries += 1;
        first_ordinal.get_or_insert(header.ordinal);
        last_ordinal = Some(header.ordinal);
        *queues.entry(header.queue).or_insert(0u64) += 1;
    }

    Ok(TraceInfo {
        format_version: header.format_version,
        api_version: format_api_version(header.api_version),
        flags: header.flags,
        meta,
        indexed,
        chunks: reader.chunks_read(),
        entries,
        first_ordinal,
        last_ordinal,
        queues,
    })
}

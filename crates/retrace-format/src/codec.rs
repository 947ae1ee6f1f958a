//! Entry codec: one API call record to and from bytes.
//!
//! Encoding walks the argument values and needs no descriptor. Decoding is driven by the
//! [`FunctionDescriptor`] of the entry's selector, so a payload can only be interpreted once the
//! selector is known to the [`DescriptorTable`].

use crate::descriptor::{ArgKind, DescriptorTable, FunctionDescriptor};
use crate::entry::{ArgValue, DecodedCall, Entry, EntryHeader, FunctionSelector, RecordedHandle, Value};
use crate::io::{push_u16_le, push_u32_le, push_u64_le, push_u8, ByteCursor};

/// Fixed part of an encoded entry, before the wait/signal token lists.
pub const ENTRY_FIXED_SIZE: usize = 4 + 4 + 8 + 4 + 2 + 2;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown function selector {selector} at ordinal {ordinal}")]
    UnknownFunction {
        selector: FunctionSelector,
        ordinal: u64,
    },

    #[error("truncated entry: need {needed} bytes at offset {offset}, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("malformed {function} payload at ordinal {ordinal}: {reason}")]
    Malformed {
        function: String,
        ordinal: u64,
        reason: String,
    },

    #[error("{what} length {len} exceeds the encodable maximum")]
    TooLarge { what: &'static str, len: usize },

    #[error("{function}: argument {index} ({name}) has shape {actual}, descriptor expects {expected:?}")]
    LayoutMismatch {
        function: String,
        index: usize,
        name: String,
        expected: ArgKind,
        actual: &'static str,
    },
}

fn len_u32(what: &'static str, len: usize) -> Result<u32, CodecError> {
    u32::try_from(len).map_err(|_| CodecError::TooLarge { what, len })
}

fn len_u16(what: &'static str, len: usize) -> Result<u16, CodecError> {
    u16::try_from(len).map_err(|_| CodecError::TooLarge { what, len })
}

fn encode_value(out: &mut Vec<u8>, value: &ArgValue) -> Result<(), CodecError> {
    match value {
        Value::U8(v) => push_u8(out, *v),
        Value::U16(v) => push_u16_le(out, *v),
        Value::U32(v) => push_u32_le(out, *v),
        Value::U64(v) => push_u64_le(out, *v),
        Value::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::I64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::F32(v) => push_u32_le(out, v.to_bits()),
        Value::F64(v) => push_u64_le(out, v.to_bits()),
        Value::Bytes(bytes) => {
            push_u32_le(out, len_u32("byte blob", bytes.len())?);
            out.extend_from_slice(bytes);
        }
        Value::Str(s) => {
            push_u32_le(out, len_u32("string", s.len())?);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Handle(_, handle) => push_u64_le(out, handle.0),
        Value::Optional(None) => push_u8(out, 0),
        Value::Optional(Some(inner)) => {
            push_u8(out, 1);
            encode_value(out, inner)?;
        }
        Value::Array(items) => {
            push_u32_le(out, len_u32("array", items.len())?);
            for item in items {
                encode_value(out, item)?;
            }
        }
        Value::Struct(members) => {
            for member in members {
                encode_value(out, member)?;
            }
        }
    }
    Ok(())
}

/// Encodes an argument list into a payload.
pub fn encode_args(args: &[ArgValue]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    for arg in args {
        encode_value(&mut out, arg)?;
    }
    Ok(out)
}

pub(crate) fn write_entry(
    out: &mut Vec<u8>,
    header: &EntryHeader,
    payload: &[u8],
) -> Result<(), CodecError> {
    let wait_count = len_u16("wait token list", header.waits.len())?;
    let signal_count = len_u16("signal token list", header.signals.len())?;
    let payload_len = len_u32("payload", payload.len())?;

    out.reserve(ENTRY_FIXED_SIZE + 8 * (header.waits.len() + header.signals.len()) + 4 + payload.len());
    push_u32_le(out, header.selector.0);
    push_u32_le(out, header.queue);
    push_u64_le(out, header.ordinal);
    out.extend_from_slice(&header.result.to_le_bytes());
    push_u16_le(out, wait_count);
    push_u16_le(out, signal_count);
    for token in header.waits.iter().chain(&header.signals) {
        push_u64_le(out, *token);
    }
    push_u32_le(out, payload_len);
    out.extend_from_slice(payload);
    Ok(())
}

pub(crate) fn read_entry(cursor: &mut ByteCursor<'_>) -> Result<Entry, CodecError> {
    let selector = FunctionSelector(cursor.u32()?);
    let queue = cursor.u32()?;
    let ordinal = cursor.u64()?;
    let result = cursor.i32()?;
    let wait_count = usize::from(cursor.u16()?);
    let signal_count = usize::from(cursor.u16()?);

    // Bound the token lists by what is actually left before allocating.
    let token_bytes = 8 * (wait_count + signal_count);
    if token_bytes > cursor.remaining() {
        return Err(CodecError::Truncated {
            offset: cursor.position(),
            needed: token_bytes,
            available: cursor.remaining(),
        });
    }
    let mut waits = Vec::with_capacity(wait_count);
    for _ in 0..wait_count {
        waits.push(cursor.u64()?);
    }
    let mut signals = Vec::with_capacity(signal_count);
    for _ in 0..signal_count {
        signals.push(cursor.u64()?);
    }

    let payload_len = cursor.u32()? as usize;
    let payload = cursor.take(payload_len)?.to_vec();

    Ok(Entry {
        header: EntryHeader {
            selector,
            queue,
            ordinal,
            result,
            waits,
            signals,
        },
        payload,
    })
}

/// Converts a decoded call back into its framed form.
pub fn to_entry(call: &DecodedCall) -> Result<Entry, CodecError> {
    Ok(Entry {
        header: call.header.clone(),
        payload: encode_args(&call.args)?,
    })
}

/// Encodes a complete entry (header, token lists and payload).
pub fn encode(call: &DecodedCall) -> Result<Vec<u8>, CodecError> {
    let payload = encode_args(&call.args)?;
    let mut out = Vec::new();
    write_entry(&mut out, &call.header, &payload)?;
    Ok(out)
}

/// Decodes exactly one complete entry from `bytes`.
pub fn decode(bytes: &[u8], table: &DescriptorTable) -> Result<DecodedCall, CodecError> {
    let mut cursor = ByteCursor::new(bytes);
    let entry = read_entry(&mut cursor)?;
    if cursor.remaining() != 0 {
        let function = table
            .get(entry.header.selector)
            .map(|d| d.name.clone())
            .unwrap_or_else(|| entry.header.selector.to_string());
        return Err(CodecError::Malformed {
            function,
            ordinal: entry.header.ordinal,
            reason: format!("{} bytes after the end of the entry", cursor.remaining()),
        });
    }
    decode_entry(&entry, table)
}

/// Interprets an entry's payload using the descriptor for its selector.
pub fn decode_entry(entry: &Entry, table: &DescriptorTable) -> Result<DecodedCall, CodecError> {
    let header = &entry.header;
    let desc = table
        .get(header.selector)
        .ok_or(CodecError::UnknownFunction {
            selector: header.selector,
            ordinal: header.ordinal,
        })?;
    let args = decode_args(desc, &entry.payload, header.ordinal)?;
    Ok(DecodedCall {
        header: header.clone(),
        args,
    })
}

/// Decodes a payload laid out per `desc`. Every payload byte must be consumed.
pub fn decode_args(
    desc: &FunctionDescriptor,
    payload: &[u8],
    ordinal: u64,
) -> Result<Vec<ArgValue>, CodecError> {
    let malformed = |reason: String| CodecError::Malformed {
        function: desc.name.clone(),
        ordinal,
        reason,
    };

    let mut cursor = ByteCursor::new(payload);
    let mut args = Vec::with_capacity(desc.params.len());
    for param in &desc.params {
        let value = decode_value(&mut cursor, &param.kind).map_err(|err| match err {
            CodecError::Truncated {
                offset,
                needed,
                available,
            } => malformed(format!(
                "payload ends inside {} (need {needed} bytes at offset {offset}, {available} left)",
                param.name
            )),
            CodecError::Malformed { reason, .. } => malformed(format!("{}: {reason}", param.name)),
            other => other,
        })?;
        args.push(value);
    }
    if cursor.remaining() != 0 {
        return Err(malformed(format!(
            "{} trailing bytes after the last parameter",
            cursor.remaining()
        )));
    }
    Ok(args)
}

// Errors raised here carry placeholder context; `decode_args` fills in function and ordinal.
fn value_error(reason: String) -> CodecError {
    CodecError::Malformed {
        function: String::new(),
        ordinal: 0,
        reason,
    }
}

fn decode_value(cursor: &mut ByteCursor<'_>, kind: &ArgKind) -> Result<ArgValue, CodecError> {
    Ok(match kind {
        ArgKind::U8 => Value::U8(cursor.u8()?),
        ArgKind::U16 => Value::U16(cursor.u16()?),
        ArgKind::U32 => Value::U32(cursor.u32()?),
        ArgKind::U64 => Value::U64(cursor.u64()?),
        ArgKind::I32 => Value::I32(cursor.i32()?),
        ArgKind::I64 => Value::I64(cursor.i64()?),
        ArgKind::F32 => Value::F32(f32::from_bits(cursor.u32()?)),
        ArgKind::F64 => Value::F64(f64::from_bits(cursor.u64()?)),
        ArgKind::Bytes => {
            let len = cursor.u32()? as usize;
            Value::Bytes(cursor.take(len)?.to_vec())
        }
        ArgKind::Str => {
            let offset = cursor.position();
            let len = cursor.u32()? as usize;
            let bytes = cursor.take(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| value_error(format!("invalid UTF-8 string at offset {offset}")))?;
            Value::Str(s.to_owned())
        }
        ArgKind::Handle(ty) => Value::Handle(*ty, RecordedHandle(cursor.u64()?)),
        ArgKind::Optional(inner) => {
            let offset = cursor.position();
            match cursor.u8()? {
                0 => Value::Optional(None),
                1 => Value::Optional(Some(Box::new(decode_value(cursor, inner)?))),
                other => {
                    return Err(value_error(format!(
                        "invalid presence byte {other} at offset {offset}"
                    )))
                }
            }
        }
        ArgKind::Array(inner) => {
            let offset = cursor.position();
            let count = cursor.u32()? as usize;
            let min = inner.min_encoded_len().max(1);
            if count.saturating_mul(min) > cursor.remaining() {
                return Err(value_error(format!(
                    "array count {count} at offset {offset} exceeds the remaining {} bytes",
                    cursor.remaining()
                )));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(cursor, inner)?);
            }
            Value::Array(items)
        }
        ArgKind::Struct(members) => Value::Struct(
            members
                .iter()
                .map(|member| decode_value(cursor, member))
                .collect::<Result<_, _>>()?,
        ),
    })
}

/// Checks `call` against its descriptor and encodes it. Used on the capture path so that a
/// trace never contains an entry the replayer cannot decode.
pub fn encode_call_checked(
    call: &DecodedCall,
    table: &DescriptorTable,
) -> Result<Vec<u8>, CodecError> {
    let desc = table
        .get(call.header.selector)
        .ok_or(CodecError::UnknownFunction {
            selector: call.header.selector,
            ordinal: call.header.ordinal,
        })?;
    if call.args.len() != desc.params.len() {
        return Err(CodecError::Malformed {
            function: desc.name.clone(),
            ordinal: call.header.ordinal,
            reason: format!(
                "{} arguments supplied, descriptor declares {}",
                call.args.len(),
                desc.params.len()
            ),
        });
    }
    for (index, (param, arg)) in desc.params.iter().zip(&call.args).enumerate() {
        if !param.kind.matches(arg) {
            return Err(CodecError::LayoutMismatch {
                function: desc.name.clone(),
                index,
                name: param.name.clone(),
                expected: param.kind.clone(),
                actual: arg.kind_name(),
            });
        }
    }
    encode(call)
}

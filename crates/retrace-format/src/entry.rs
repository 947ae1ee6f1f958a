//! Entry records: the raw framed form read from a chunk and the decoded, inert call form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::ObjectType;

/// Identifies an API entry point. Assigned by the descriptor table generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionSelector(pub u32);

impl fmt::Display for FunctionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// An object handle value as observed at capture time. Opaque; never dereferenced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordedHandle(pub u64);

impl RecordedHandle {
    pub const NULL: RecordedHandle = RecordedHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RecordedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Fields shared by the raw and decoded forms of an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub selector: FunctionSelector,
    /// Logical submission queue (or recording thread) the call belongs to.
    pub queue: u32,
    /// Monotonic sequence number assigned at capture.
    pub ordinal: u64,
    /// Result code returned at capture (`VkResult` numbering; 0 for `void` calls).
    pub result: i32,
    /// Cross-queue tokens that must be signaled before this entry may be dispatched.
    pub waits: Vec<u64>,
    /// Cross-queue tokens signaled once this entry has been dispatched.
    pub signals: Vec<u64>,
}

impl EntryHeader {
    pub fn new(selector: FunctionSelector, queue: u32) -> Self {
        Self {
            selector,
            queue,
            ordinal: 0,
            result: 0,
            waits: Vec::new(),
            signals: Vec::new(),
        }
    }
}

/// A framed entry whose argument payload has not been interpreted yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub header: EntryHeader,
    pub payload: Vec<u8>,
}

/// A decoded call: the header plus arguments laid out per the function's descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedCall {
    pub header: EntryHeader,
    pub args: Vec<ArgValue>,
}

impl DecodedCall {
    pub fn new(selector: FunctionSelector, queue: u32, args: Vec<ArgValue>) -> Self {
        Self {
            header: EntryHeader::new(selector, queue),
            args,
        }
    }

    pub fn with_result(mut self, result: i32) -> Self {
        self.header.result = result;
        self
    }

    pub fn with_waits(mut self, waits: impl Into<Vec<u64>>) -> Self {
        self.header.waits = waits.into();
        self
    }

    pub fn with_signals(mut self, signals: impl Into<Vec<u64>>) -> Self {
        self.header.signals = signals.into();
        self
    }

    pub fn ordinal(&self) -> u64 {
        self.header.ordinal
    }
}

/// One argument value. `H` is the handle representation: recorded handles in traces, live
/// handles once the dispatcher has resolved them.
#[derive(Clone, Debug)]
pub enum Value<H> {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bytes(Vec<u8>),
    Str(String),
    Handle(ObjectType, H),
    Optional(Option<Box<Value<H>>>),
    Array(Vec<Value<H>>),
    Struct(Vec<Value<H>>),
}

pub type ArgValue = Value<RecordedHandle>;

impl<H> Value<H> {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Bytes(_) => "bytes",
            Value::Str(_) => "str",
            Value::Handle(..) => "handle",
            Value::Optional(_) => "optional",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U8(v) => Some(v.into()),
            Value::U16(v) => Some(v.into()),
            Value::U32(v) => Some(v.into()),
            Value::U64(v) => Some(v),
            _ => None,
        }
    }

    /// Visits every handle in depth-first argument order.
    pub fn for_each_handle<F>(&self, f: &mut F)
    where
        F: FnMut(ObjectType, &H),
    {
        match self {
            Value::Handle(ty, h) => f(*ty, h),
            Value::Optional(Some(inner)) => inner.for_each_handle(f),
            Value::Array(items) | Value::Struct(items) => {
                for item in items {
                    item.for_each_handle(f);
                }
            }
            _ => {}
        }
    }

    /// Rebuilds the value with every handle replaced by `f`'s result, preserving shape.
    pub fn map_handles<H2, E, F>(&self, f: &mut F) -> Result<Value<H2>, E>
    where
        F: FnMut(ObjectType, &H) -> Result<H2, E>,
    {
        Ok(match self {
            Value::U8(v) => Value::U8(*v),
            Value::U16(v) => Value::U16(*v),
            Value::U32(v) => Value::U32(*v),
            Value::U64(v) => Value::U64(*v),
            Value::I32(v) => Value::I32(*v),
            Value::I64(v) => Value::I64(*v),
            Value::F32(v) => Value::F32(*v),
            Value::F64(v) => Value::F64(*v),
            Value::Bytes(v) => Value::Bytes(v.clone()),
            Value::Str(v) => Value::Str(v.clone()),
            Value::Handle(ty, h) => Value::Handle(*ty, f(*ty, h)?),
            Value::Optional(None) => Value::Optional(None),
            Value::Optional(Some(inner)) => Value::Optional(Some(Box::new(inner.map_handles(f)?))),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.map_handles(f))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Struct(items) => Value::Struct(
                items
                    .iter()
                    .map(|item| item.map_handles(f))
                    .collect::<Result<_, _>>()?,
            ),
        })
    }
}

// Floats compare bitwise so that decode(encode(x)) == x holds for NaN payloads too.
impl<H: PartialEq> PartialEq for Value<H> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a.to_bits() == b.to_bits(),
            (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Handle(ta, a), Value::Handle(tb, b)) => ta == tb && a == b,
            (Value::Optional(a), Value::Optional(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            _ => false,
        }
    }
}

impl<H: Eq> Eq for Value<H> {}

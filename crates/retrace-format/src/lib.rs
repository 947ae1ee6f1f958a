//! Retrace trace container and entry codec.
//!
//! A trace is a header followed by independently decompressible chunks, each holding a whole
//! number of encoded API call entries. The per-function argument layout is not part of the file:
//! it comes from a [`DescriptorTable`] keyed by [`FunctionSelector`].

pub mod codec;
pub mod descriptor;
pub mod entry;
mod error;
pub mod format;
mod io;
mod reader;
mod vulkan;
mod writer;

pub use codec::CodecError;
pub use descriptor::{
    ArgKind, CallRole, DescriptorError, DescriptorTable, Direction, FunctionDescriptor,
    ObjectType, ParamDesc,
};
pub use entry::{ArgValue, DecodedCall, Entry, EntryHeader, FunctionSelector, RecordedHandle, Value};
pub use error::TraceError;
pub use format::{
    ChunkHeader, Compression, TocEntry, TraceHeader, TraceMeta, FORMAT_VERSION, TRACE_HEADER_SIZE,
};
pub use reader::{EntryLocation, LocatedEntry, ReaderOptions, TraceReader};
pub use vulkan::selectors;
pub use writer::{Recorder, TraceWriter, WriterOptions};

//! Boundary between the replay engine and the live graphics driver.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use retrace_format::{FunctionDescriptor, ObjectType, RecordedHandle, Value};
use serde::Serialize;

use crate::shader_cache::ContentHash;

/// An object handle issued by the live driver during replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LiveHandle(pub u64);

impl LiveHandle {
    pub const NULL: LiveHandle = LiveHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// An argument with every handle replaced by its live counterpart. Output handle slots hold
/// [`LiveHandle::NULL`].
pub type LiveValue = Value<LiveHandle>;

/// A decoded call ready to be issued against the driver.
#[derive(Debug)]
pub struct LiveCall<'a> {
    pub descriptor: &'a FunctionDescriptor,
    pub ordinal: u64,
    pub queue: u32,
    /// Result the call returned at capture time.
    pub recorded_result: i32,
    pub args: Vec<LiveValue>,
    /// Objects the capture saw created, in output-argument order. The adapter must return one
    /// live handle per slot in [`CallOutcome::created`].
    pub outputs: &'a [(ObjectType, RecordedHandle)],
    /// Driver binary for compile calls, served from the shader cache or a fresh compile.
    pub compiled: Option<&'a [u8]>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallOutcome {
    pub result: i32,
    pub created: Vec<LiveHandle>,
}

/// What a compile request builds from.
#[derive(Clone, Copy, Debug)]
pub enum CompileSource<'a> {
    /// Shader bytecode. Needs no live objects, so it may compile ahead of dispatch.
    Bytecode(&'a [u8]),
    /// Pipeline create-info with its shader modules and layouts already resolved to live
    /// handles.
    Pipeline(&'a LiveValue),
}

#[derive(Debug)]
pub struct CompileRequest<'a> {
    pub function: &'a str,
    pub ordinal: u64,
    /// Cache key of the binary.
    pub hash: ContentHash,
    pub source: CompileSource<'a>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("{0}")]
    Failed(String),

    #[error("{0} is not supported by this driver")]
    Unsupported(String),

    #[error("shader compilation failed: {0}")]
    Compile(String),

    #[error("cancelled")]
    Cancelled,
}

/// A live driver. Calls for different queues arrive concurrently from separate worker threads.
pub trait DriverAdapter: Send + Sync {
    fn invoke(&self, call: &LiveCall<'_>) -> Result<CallOutcome, DriverError>;

    /// Produces the driver binary for shader bytecode or a pipeline create-info.
    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u8>, DriverError>;

    /// Destroys an object left alive at the end of a run.
    fn release(&self, object_type: ObjectType, handle: LiveHandle) -> Result<(), DriverError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StubDriverStats {
    pub invocations: u64,
    pub compiles: u64,
    pub releases: u64,
    pub handles_issued: u64,
}

/// Inert adapter: every call returns its recorded result and creation calls receive fresh
/// handle values. Used for trace validation and tests.
pub struct StubDriver {
    next_handle: AtomicU64,
    invocations: AtomicU64,
    compiles: AtomicU64,
    releases: AtomicU64,
}

const STUB_FIRST_HANDLE: u64 = 0x1000;

impl StubDriver {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(STUB_FIRST_HANDLE),
            invocations: AtomicU64::new(0),
            compiles: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> StubDriverStats {
        StubDriverStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            handles_issued: self.next_handle.load(Ordering::Relaxed) - STUB_FIRST_HANDLE,
        }
    }
}

impl Default for StubDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverAdapter for StubDriver {
    fn invoke(&self, call: &LiveCall<'_>) -> Result<CallOutcome, DriverError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        let created = call
            .outputs
            .iter()
            .map(|(_, recorded)| {
                if call.recorded_result < 0 || recorded.is_null() {
                    LiveHandle::NULL
                } else {
                    LiveHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
                }
            })
            .collect();
        Ok(CallOutcome {
            result: call.recorded_result,
            created,
        })
    }

    fn compile(&self, request: &CompileRequest<'_>) -> Result<Vec<u8>, DriverError> {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        let mut binary = b"STUB".to_vec();
        match request.source {
            CompileSource::Bytecode(bytecode) => {
                binary.extend_from_slice(blake3::hash(bytecode).as_bytes());
            }
            CompileSource::Pipeline(_) => binary.extend_from_slice(&request.hash.0),
        }
        Ok(binary)
    }

    fn release(&self, _object_type: ObjectType, _handle: LiveHandle) -> Result<(), DriverError> {
        self.releases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

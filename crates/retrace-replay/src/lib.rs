//! Replay engine for retrace captures.
//!
//! [`Replayer`] reads a trace through [`retrace_format::TraceReader`], maps recorded object
//! handles to live ones through a [`HandleTable`], serves shader compiles from a
//! [`ShaderCache`] and forwards every call to a [`DriverAdapter`].

mod compile;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod dump;
mod error;
pub mod handle_table;
mod identity;
pub mod shader_cache;
mod sync;

pub use config::{ConfigError, MismatchPolicy, ReplayOptions, ShaderCacheConfig};
pub use dispatcher::{ReplayReport, ReplayState, Replayer};
pub use driver::{
    CallOutcome, CompileRequest, CompileSource, DriverAdapter, DriverError, LiveCall, LiveHandle,
    LiveValue, StubDriver, StubDriverStats,
};
pub use error::{FailureClass, ReplayError};
pub use handle_table::{
    HandleError, HandleRecord, HandleState, HandleTable, Origin, ResolutionFailure,
    SharedHandleTable,
};
pub use shader_cache::{ContentHash, ShaderCache, ShaderCacheStats};
pub use sync::CancelToken;

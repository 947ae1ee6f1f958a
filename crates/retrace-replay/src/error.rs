use retrace_format::{CodecError, EntryLocation, FunctionSelector, TraceError};
use thiserror::Error;

use crate::handle_table::HandleError;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("corrupt trace: {0}")]
    CorruptTrace(#[source] TraceError),

    #[error("malformed entry at ordinal {ordinal} ({location}): {source}")]
    MalformedEntry {
        ordinal: u64,
        location: EntryLocation,
        source: CodecError,
    },

    #[error("unknown function selector {selector} at ordinal {ordinal} ({location})")]
    UnknownFunction {
        selector: FunctionSelector,
        ordinal: u64,
        location: EntryLocation,
    },

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("{function} at ordinal {ordinal}: {reason}")]
    DriverCall {
        function: String,
        ordinal: u64,
        recorded: i32,
        /// `None` when the adapter returned an error instead of a result code.
        live: Option<i32>,
        reason: String,
    },

    #[error("queue {queue} waits at ordinal {ordinal} on token {token}, which nothing left in the trace signals")]
    UnsatisfiedWait { queue: u32, token: u64, ordinal: u64 },

    #[error("replay cancelled")]
    Cancelled,

    #[error("this replayer has already run")]
    AlreadyRan,
}

/// Coarse failure category, stable for scripting against the `retrace` exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    CorruptTrace,
    UnknownFunction,
    HandleResolution,
    DriverCall,
    UnsatisfiedWait,
    Cancelled,
    Other,
}

impl FailureClass {
    pub fn exit_code(self) -> u8 {
        match self {
            FailureClass::Other => 1,
            FailureClass::CorruptTrace => 3,
            FailureClass::UnknownFunction => 4,
            FailureClass::HandleResolution => 5,
            FailureClass::DriverCall => 6,
            FailureClass::UnsatisfiedWait => 7,
            FailureClass::Cancelled => 8,
        }
    }

    pub fn of_trace_error(err: &TraceError) -> Self {
        match err {
            TraceError::Codec(CodecError::UnknownFunction { .. }) => FailureClass::UnknownFunction,
            TraceError::Codec(_) => FailureClass::CorruptTrace,
            err if err.is_corruption() => FailureClass::CorruptTrace,
            _ => FailureClass::Other,
        }
    }
}

impl ReplayError {
    pub fn class(&self) -> FailureClass {
        match self {
            ReplayError::CorruptTrace(err) => FailureClass::of_trace_error(err),
            ReplayError::MalformedEntry { .. } => FailureClass::CorruptTrace,
            ReplayError::UnknownFunction { .. } => FailureClass::UnknownFunction,
            ReplayError::Handle(_) => FailureClass::HandleResolution,
            ReplayError::DriverCall { .. } => FailureClass::DriverCall,
            ReplayError::UnsatisfiedWait { .. } => FailureClass::UnsatisfiedWait,
            ReplayError::Cancelled => FailureClass::Cancelled,
            ReplayError::AlreadyRan => FailureClass::Other,
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.class().exit_code()
    }
}

//! Runtime representation of a compiled computation as a tree of thunks.
//!
//! A thunk is initialized once and may then be executed any number of times.
//! Leaf thunks hold only read-only state during execution, so one instance can
//! be executed on several streams concurrently as long as each execution uses
//! its own [`BufferAllocations`].

mod concatenate;
mod constant;
mod copy;
mod custom_call;
mod emitter;
mod sequential;

use std::fmt;

use thiserror::Error;

use crate::buffer_assignment::{BufferAllocationIndex, BufferAssignmentError};
use crate::executable::ExecutableInfo;
use crate::hlo::InstructionId;
use crate::runtime::{BufferAllocations, ExecutionProfiler, Stream, StreamError, StreamExecutor};

pub use concatenate::{plan_chunks, ConcatenateChunk, ConcatenateThunk};
pub use constant::ConstantThunk;
pub use copy::{CopyThunk, Relayout};
pub use custom_call::CustomCallThunk;
pub use emitter::{
    element_strides, emit_thunks, matmul_symbol, EmitError, EmitResult, MatMulDescriptor,
};
pub use sequential::SequentialThunk;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("thunk {0} executed before initialization")]
    NotInitialized(String),
    #[error("thunk {thunk} failed to initialize: {reason}")]
    Initialization { thunk: String, reason: String },
    #[error("custom call target '{0}' is not registered")]
    UnresolvedSymbol(String),
    #[error("buffer {allocation} unavailable: {reason}")]
    InvalidBuffer {
        allocation: BufferAllocationIndex,
        reason: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("thunk {thunk} failed: {message}")]
    Failed { thunk: String, message: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    BufferAssignment(#[from] BufferAssignmentError),
}

impl ExecutionError {
    pub fn failed(thunk: impl Into<String>, message: impl Into<String>) -> Self {
        ExecutionError::Failed {
            thunk: thunk.into(),
            message: message.into(),
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Closed set of execution-unit kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThunkKind {
    Constant,
    Copy,
    Concatenate,
    CustomCall,
    Sequential,
}

impl ThunkKind {
    pub fn name(self) -> &'static str {
        match self {
            ThunkKind::Constant => "constant",
            ThunkKind::Copy => "copy",
            ThunkKind::Concatenate => "concatenate",
            ThunkKind::CustomCall => "custom-call",
            ThunkKind::Sequential => "sequential",
        }
    }
}

impl fmt::Display for ThunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Back-reference to the instruction a thunk was emitted for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThunkInfo {
    pub instruction: Option<InstructionId>,
    pub name: String,
}

impl ThunkInfo {
    pub fn new(instruction: Option<InstructionId>, name: impl Into<String>) -> Self {
        Self {
            instruction,
            name: name.into(),
        }
    }

    pub fn for_instruction(instruction: InstructionId, name: impl Into<String>) -> Self {
        Self::new(Some(instruction), name)
    }

    /// Profiler annotation: `kind:name`.
    pub fn annotation(&self, kind: ThunkKind) -> String {
        format!("{kind}:{}", self.name)
    }
}

/// One executable step of a compiled computation.
pub trait Thunk: Send + Sync + fmt::Debug {
    fn kind(&self) -> ThunkKind;

    fn info(&self) -> &ThunkInfo;

    /// Prepares the thunk for execution. Called once before the first execution.
    fn initialize(
        &mut self,
        executable: &ExecutableInfo,
        executor: &dyn StreamExecutor,
    ) -> ExecutionResult<()>;

    /// Enqueues the thunk's work on `stream`.
    fn execute_on_stream(
        &self,
        buffers: &BufferAllocations<'_>,
        stream: &dyn Stream,
        profiler: &ExecutionProfiler,
    ) -> ExecutionResult<()>;
}

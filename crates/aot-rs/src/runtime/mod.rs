//! Device abstraction consumed by thunks: memory handles, streams, executors,
//! per-execution buffer bindings and profiling.

mod buffer_allocations;
mod profiler;
mod stream;

pub use buffer_allocations::BufferAllocations;
pub use profiler::{ExecutionProfiler, ProfileReport, ProfileRow, ScopeGuard};
pub use stream::{DeviceMemory, HostCallback, Stream, StreamError, StreamExecutor, StreamResult};

use std::sync::Arc;

use crate::buffer_assignment::BufferSlice;
use crate::executable::ExecutableInfo;
use crate::runtime::{BufferAllocations, ExecutionProfiler, Stream, StreamExecutor};

use super::{ExecutionError, ExecutionResult, Thunk, ThunkInfo, ThunkKind};

/// Uploads literal bytes, already in the destination's physical layout.
#[derive(Debug)]
pub struct ConstantThunk {
    info: ThunkInfo,
    bytes: Arc<[u8]>,
    destination: BufferSlice,
}

impl ConstantThunk {
    pub fn new(info: ThunkInfo, bytes: Arc<[u8]>, destination: BufferSlice) -> Self {
        Self {
            info,
            bytes,
            destination,
        }
    }
}

impl Thunk for ConstantThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Constant
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn initialize(&mut self, _: &ExecutableInfo, _: &dyn StreamExecutor) -> ExecutionResult<()> {
        if self.bytes.len() != self.destination.size {
            return Err(ExecutionError::Initialization {
                thunk: self.info.name.clone(),
                reason: format!(
                    "literal has {} bytes, buffer {}",
                    self.bytes.len(),
                    self.destination.size
                ),
            });
        }
        Ok(())
    }

    fn execute_on_stream(
        &self,
        buffers: &BufferAllocations<'_>,
        stream: &dyn Stream,
        profiler: &ExecutionProfiler,
    ) -> ExecutionResult<()> {
        let _scope = profiler.scope(self.info.annotation(ThunkKind::Constant));
        let dst = buffers.device_address(self.destination)?;
        stream.memcpy_host_to_device(dst, Arc::clone(&self.bytes))?;
        Ok(())
    }
}

use crate::buffer_assignment::BufferSlice;
use crate::executable::ExecutableInfo;
use crate::runtime::{BufferAllocations, ExecutionProfiler, Stream, StreamExecutor};

use super::{ExecutionError, ExecutionResult, Thunk, ThunkInfo, ThunkKind};

/// One contiguous byte run copied from an operand into the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcatenateChunk {
    pub operand: usize,
    pub src_offset: usize,
    pub dst_offset: usize,
    pub size: usize,
}

/// Row-major concatenation as a list of device-to-device copies.
#[derive(Debug)]
pub struct ConcatenateThunk {
    info: ThunkInfo,
    operands: Vec<BufferSlice>,
    destination: BufferSlice,
    chunks: Vec<ConcatenateChunk>,
}

impl ConcatenateThunk {
    /// `operand_dims` are the logical dims of each operand, all stored row-major.
    pub fn new(
        info: ThunkInfo,
        operands: Vec<BufferSlice>,
        operand_dims: &[Vec<usize>],
        dimension: usize,
        element_bytes: usize,
        destination: BufferSlice,
    ) -> Self {
        let chunks = plan_chunks(operand_dims, dimension, element_bytes);
        Self {
            info,
            operands,
            destination,
            chunks,
        }
    }

    pub fn chunks(&self) -> &[ConcatenateChunk] {
        &self.chunks
    }
}

/// Splits a row-major concatenation into contiguous copies.
///
/// Everything left of `dimension` is the outer loop; each operand contributes
/// one contiguous run per outer index.
pub fn plan_chunks(
    operand_dims: &[Vec<usize>],
    dimension: usize,
    element_bytes: usize,
) -> Vec<ConcatenateChunk> {
    let Some(first) = operand_dims.first() else {
        return Vec::new();
    };
    let outer: usize = first[..dimension].iter().product();
    let inner: usize = first[dimension + 1..].iter().product();
    let runs: Vec<usize> = operand_dims
        .iter()
        .map(|dims| dims[dimension] * inner * element_bytes)
        .collect();
    let row: usize = runs.iter().sum();

    let mut chunks = Vec::with_capacity(outer * runs.len());
    for o in 0..outer {
        let mut dst_offset = o * row;
        for (operand, run) in runs.iter().enumerate() {
            if *run > 0 {
                chunks.push(ConcatenateChunk {
                    operand,
                    src_offset: o * run,
                    dst_offset,
                    size: *run,
                });
            }
            dst_offset += run;
        }
    }
    chunks
}

impl Thunk for ConcatenateThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Concatenate
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn initialize(&mut self, _: &ExecutableInfo, _: &dyn StreamExecutor) -> ExecutionResult<()> {
        let written: usize = self.chunks.iter().map(|c| c.size).sum();
        if written != self.destination.size {
            return Err(ExecutionError::Initialization {
                thunk: self.info.name.clone(),
                reason: format!(
                    "chunks cover {written} bytes, output has {}",
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
        let _scope = profiler.scope(self.info.annotation(ThunkKind::Concatenate));
        let dst = buffers.device_address(self.destination)?;
        for chunk in &self.chunks {
            let operand = self.operands.get(chunk.operand).copied().ok_or_else(|| {
                ExecutionError::failed(&self.info.name, format!("missing operand {}", chunk.operand))
            })?;
            let src = buffers
                .device_address(operand)?
                .slice(chunk.src_offset, chunk.size)?;
            let dst = dst.slice(chunk.dst_offset, chunk.size)?;
            stream.memcpy_device_to_device(dst, src, chunk.size)?;
        }
        Ok(())
    }
}

use tracing::trace;

use crate::buffer_assignment::{AllocationKind, BufferAllocationIndex, BufferAssignment, BufferSlice};
use crate::hlo::ShapeIndex;
use crate::thunk::{ExecutionError, ExecutionResult};

use super::stream::{DeviceMemory, StreamExecutor};

/// Device memory bound to each allocation for one execution.
///
/// Parameter allocations borrow caller memory. Everything else is allocated
/// from the executor on construction and released on drop.
pub struct BufferAllocations<'a> {
    buffers: Vec<DeviceMemory>,
    owned: Vec<bool>,
    executor: Option<&'a dyn StreamExecutor>,
}

impl<'a> BufferAllocations<'a> {
    /// Wraps caller-managed buffers; nothing is freed on drop.
    pub fn from_buffers(buffers: Vec<DeviceMemory>) -> Self {
        let owned = vec![false; buffers.len()];
        Self {
            buffers,
            owned,
            executor: None,
        }
    }

    /// Binds `arguments` to parameter allocations and allocates the rest.
    ///
    /// `parameter_leaves` lists `(parameter number, leaf index)` in the order the
    /// caller supplies `arguments`.
    pub fn build(
        assignment: &BufferAssignment,
        parameter_leaves: &[(usize, ShapeIndex)],
        arguments: &[DeviceMemory],
        executor: &'a dyn StreamExecutor,
    ) -> ExecutionResult<Self> {
        if parameter_leaves.len() != arguments.len() {
            return Err(ExecutionError::InvalidArgument(format!(
                "expected {} argument buffers, got {}",
                parameter_leaves.len(),
                arguments.len()
            )));
        }
        let mut out = Self {
            buffers: Vec::with_capacity(assignment.allocations().len()),
            owned: Vec::with_capacity(assignment.allocations().len()),
            executor: Some(executor),
        };
        for allocation in assignment.allocations() {
            match &allocation.kind {
                AllocationKind::Parameter { number, index } => {
                    let position = parameter_leaves
                        .iter()
                        .position(|(n, i)| n == number && i == index)
                        .ok_or_else(|| ExecutionError::InvalidBuffer {
                            allocation: allocation.index,
                            reason: format!("no argument for parameter {number} at {index}"),
                        })?;
                    let memory = arguments[position];
                    if memory.size() < allocation.size {
                        return Err(ExecutionError::InvalidBuffer {
                            allocation: allocation.index,
                            reason: format!(
                                "argument {position} has {} bytes, need {}",
                                memory.size(),
                                allocation.size
                            ),
                        });
                    }
                    out.buffers.push(memory);
                    out.owned.push(false);
                }
                AllocationKind::Constant { .. } | AllocationKind::Temporary => {
                    let memory = executor.allocate(allocation.size)?;
                    trace!(allocation = %allocation.index, size = allocation.size, "allocated");
                    out.buffers.push(memory);
                    out.owned.push(true);
                }
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffer(&self, index: BufferAllocationIndex) -> ExecutionResult<DeviceMemory> {
        self.buffers
            .get(index.0)
            .copied()
            .ok_or_else(|| ExecutionError::InvalidBuffer {
                allocation: index,
                reason: format!("only {} allocations bound", self.buffers.len()),
            })
    }

    /// Device memory for `slice`.
    pub fn device_address(&self, slice: BufferSlice) -> ExecutionResult<DeviceMemory> {
        let base = self.buffer(slice.allocation)?;
        base.slice(slice.offset, slice.size)
            .map_err(|err| ExecutionError::InvalidBuffer {
                allocation: slice.allocation,
                reason: err.to_string(),
            })
    }
}

impl Drop for BufferAllocations<'_> {
    fn drop(&mut self) {
        let Some(executor) = self.executor else {
            return;
        };
        for (memory, owned) in self.buffers.iter().zip(&self.owned) {
            if *owned {
                executor.deallocate(*memory);
            }
        }
    }
}

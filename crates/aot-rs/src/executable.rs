//! A compiled computation: its buffer plan plus the thunk tree that runs it.

use std::sync::Arc;

use tracing::{debug, info};

use crate::buffer_assignment::{BufferAssignment, BufferAssignmentResult};
use crate::hlo::{Computation, Shape, ShapeIndex};
use crate::runtime::{
    BufferAllocations, DeviceMemory, ExecutionProfiler, Stream, StreamExecutor,
};
use crate::thunk::{emit_thunks, EmitResult, ExecutionError, ExecutionResult, SequentialThunk, Thunk};

/// Static facts about a compiled computation that thunks may consult.
#[derive(Debug, Clone)]
pub struct ExecutableInfo {
    pub name: String,
    pub buffer_assignment: Arc<BufferAssignment>,
    /// `(parameter number, leaf index)` for every array argument, in call order.
    pub parameter_leaves: Vec<(usize, ShapeIndex)>,
    pub parameter_shapes: Vec<Shape>,
    pub result_shape: Shape,
}

impl ExecutableInfo {
    pub fn from_computation(computation: &Computation) -> BufferAssignmentResult<Self> {
        let buffer_assignment = Arc::new(BufferAssignment::run(computation)?);
        let params = computation.parameters();
        let mut parameter_leaves = Vec::new();
        let mut parameter_shapes = Vec::with_capacity(params.len());
        for (number, param) in params.iter().enumerate() {
            for (index, leaf) in param.shape.leaves() {
                if leaf.is_array() {
                    parameter_leaves.push((number, index));
                }
            }
            parameter_shapes.push(param.shape.clone());
        }
        Ok(Self {
            name: computation.name().to_string(),
            buffer_assignment,
            parameter_leaves,
            parameter_shapes,
            result_shape: computation.result_shape().clone(),
        })
    }

    /// Byte size of each argument buffer, in call order.
    pub fn argument_sizes(&self) -> Vec<usize> {
        self.parameter_leaves
            .iter()
            .map(|(number, index)| {
                self.parameter_shapes[*number]
                    .subshape(index)
                    .map(|s| s.byte_size())
                    .unwrap_or(0)
            })
            .collect()
    }
}

/// Host copy of one array leaf of the result.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBuffer {
    pub index: ShapeIndex,
    pub shape: Shape,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub leaves: Vec<OutputBuffer>,
}

impl ExecutionOutput {
    pub fn leaf(&self, position: usize) -> Option<&OutputBuffer> {
        self.leaves.get(position)
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }
}

/// Thunk tree plus the information needed to bind its buffers.
///
/// Lifecycle: `from_computation` (created), `initialize` once, then `execute`
/// any number of times.
#[derive(Debug)]
pub struct Executable {
    info: ExecutableInfo,
    root: SequentialThunk,
}

impl Executable {
    /// Plans buffers and emits thunks for a computation whose layouts are assigned.
    pub fn from_computation(computation: &Computation) -> EmitResult<Self> {
        let info = ExecutableInfo::from_computation(computation)?;
        let root = emit_thunks(computation, &info.buffer_assignment)?;
        Ok(Self { info, root })
    }

    pub fn info(&self) -> &ExecutableInfo {
        &self.info
    }

    pub fn root(&self) -> &SequentialThunk {
        &self.root
    }

    pub fn is_initialized(&self) -> bool {
        self.root.is_initialized()
    }

    pub fn initialize(&mut self, executor: &dyn StreamExecutor) -> ExecutionResult<()> {
        self.root.initialize(&self.info, executor)?;
        info!(
            executable = %self.info.name,
            platform = executor.platform_name(),
            thunks = self.root.len(),
            "executable initialized"
        );
        Ok(())
    }

    /// Runs against caller-managed buffers on `stream` without synchronizing.
    pub fn execute_on_stream(
        &self,
        buffers: &BufferAllocations<'_>,
        stream: &dyn Stream,
        profiler: &ExecutionProfiler,
    ) -> ExecutionResult<()> {
        self.root.execute_on_stream(buffers, stream, profiler)
    }

    /// Uploads `arguments`, runs to completion and downloads every result leaf.
    ///
    /// `arguments` holds one host buffer per array leaf of the parameters, in
    /// parameter order.
    pub fn execute(
        &self,
        executor: &dyn StreamExecutor,
        arguments: &[&[u8]],
        profiler: &ExecutionProfiler,
    ) -> ExecutionResult<ExecutionOutput> {
        let sizes = self.info.argument_sizes();
        if sizes.len() != arguments.len() {
            return Err(ExecutionError::InvalidArgument(format!(
                "{} expects {} arguments, got {}",
                self.info.name,
                sizes.len(),
                arguments.len()
            )));
        }
        for (position, (expected, argument)) in sizes.iter().zip(arguments).enumerate() {
            if *expected != argument.len() {
                return Err(ExecutionError::InvalidArgument(format!(
                    "argument {position} has {} bytes, expected {expected}",
                    argument.len()
                )));
            }
        }

        let stream = executor.create_stream()?;
        let mut staged = StagedArguments {
            executor,
            stream: stream.as_ref(),
            buffers: Vec::with_capacity(arguments.len()),
        };
        for argument in arguments {
            let memory = executor.allocate(argument.len())?;
            staged.buffers.push(memory);
            stream.memcpy_host_to_device(memory, Arc::from(argument.to_vec()))?;
        }

        let buffers = BufferAllocations::build(
            &self.info.buffer_assignment,
            &self.info.parameter_leaves,
            &staged.buffers,
            executor,
        )?;
        let executed = self.root.execute_on_stream(&buffers, stream.as_ref(), profiler);
        let synced = stream.block_host_until_done();
        executed?;
        synced?;

        let mut output = ExecutionOutput::default();
        for (index, slice) in self.info.buffer_assignment.output_slices() {
            let shape = self
                .info
                .result_shape
                .subshape(index)
                .cloned()
                .ok_or_else(|| ExecutionError::failed(&self.info.name, format!("no result leaf {index}")))?;
            let mut bytes = vec![0u8; slice.size];
            stream.memcpy_device_to_host(&mut bytes, buffers.device_address(*slice)?)?;
            output.leaves.push(OutputBuffer {
                index: index.clone(),
                shape,
                bytes,
            });
        }
        debug!(executable = %self.info.name, outputs = output.len(), "execution finished");
        Ok(output)
    }
}

/// Argument buffers uploaded for one `execute` call; drained and freed on drop.
struct StagedArguments<'a> {
    executor: &'a dyn StreamExecutor,
    stream: &'a dyn Stream,
    buffers: Vec<DeviceMemory>,
}

impl Drop for StagedArguments<'_> {
    fn drop(&mut self) {
        if self.stream.block_host_until_done().is_err() {
            debug!("stream reported an error while releasing argument buffers");
        }
        for memory in self.buffers.drain(..) {
            self.executor.deallocate(memory);
        }
    }
}

use tracing::warn;

use crate::executable::ExecutableInfo;
use crate::runtime::{BufferAllocations, ExecutionProfiler, Stream, StreamExecutor};

use super::{ExecutionError, ExecutionResult, Thunk, ThunkInfo, ThunkKind};

/// Runs its children strictly in construction order.
///
/// Initialization and execution both stop at the first failing child and
/// return that child's error; later children are never touched.
#[derive(Debug)]
pub struct SequentialThunk {
    info: ThunkInfo,
    thunks: Vec<Box<dyn Thunk>>,
    initialized: bool,
}

impl SequentialThunk {
    pub fn new(info: ThunkInfo, thunks: Vec<Box<dyn Thunk>>) -> Self {
        Self {
            info,
            thunks,
            initialized: false,
        }
    }

    pub fn thunks(&self) -> &[Box<dyn Thunk>] {
        &self.thunks
    }

    pub fn len(&self) -> usize {
        self.thunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.thunks.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}

impl Thunk for SequentialThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Sequential
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        executable: &ExecutableInfo,
        executor: &dyn StreamExecutor,
    ) -> ExecutionResult<()> {
        for (position, thunk) in self.thunks.iter_mut().enumerate() {
            if let Err(err) = thunk.initialize(executable, executor) {
                warn!(
                    sequence = %self.info.name,
                    position,
                    thunk = %thunk.info().name,
                    error = %err,
                    "thunk initialization failed"
                );
                return Err(err);
            }
        }
        self.initialized = true;
        Ok(())
    }

    fn execute_on_stream(
        &self,
        buffers: &BufferAllocations<'_>,
        stream: &dyn Stream,
        profiler: &ExecutionProfiler,
    ) -> ExecutionResult<()> {
        if !self.initialized {
            return Err(ExecutionError::NotInitialized(self.info.name.clone()));
        }
        let _scope = profiler.scope(self.info.annotation(ThunkKind::Sequential));
        for (position, thunk) in self.thunks.iter().enumerate() {
            if let Err(err) = thunk.execute_on_stream(buffers, stream, profiler) {
                warn!(
                    sequence = %self.info.name,
                    position,
                    thunk = %thunk.info().name,
                    error = %err,
                    "thunk execution failed"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

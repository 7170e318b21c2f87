use aot_rs::runtime::{ExecutionProfiler, StreamExecutor};
use aot_rs::thunk::{EmitError, ExecutionError};
use aot_rs::{Executable, ExecutionOutput};
use thiserror::Error;
use tracing::info;

use crate::artifact::{ArtifactError, ObjectFile};
use crate::runtime_library::register_runtime_library;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
    #[error(transparent)]
    Emit(#[from] EmitError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
}

pub type LoadResult<T> = Result<T, LoadError>;

/// An object file rebuilt into an initialized executable.
#[derive(Debug)]
pub struct HostExecutable {
    object: ObjectFile,
    executable: Executable,
}

impl HostExecutable {
    /// Decodes `bytes`, checks it targets `target_triple` and initializes it on `executor`.
    ///
    /// The host runtime library is registered first so `Dot` lowers to a known routine.
    pub fn load(
        bytes: &[u8],
        target_triple: &str,
        executor: &dyn StreamExecutor,
    ) -> LoadResult<Self> {
        let object = ObjectFile::from_bytes(bytes)?;
        if object.target_triple != target_triple {
            return Err(ArtifactError::TargetMismatch {
                found: object.target_triple.clone(),
                expected: target_triple.to_string(),
            }
            .into());
        }
        register_runtime_library();
        let mut executable = Executable::from_computation(&object.computation)?;
        executable.initialize(executor)?;
        info!(
            entry_point = %object.entry_point,
            targets = object.custom_call_targets.len(),
            "host object loaded"
        );
        Ok(Self { object, executable })
    }

    pub fn entry_point(&self) -> &str {
        &self.object.entry_point
    }

    pub fn object(&self) -> &ObjectFile {
        &self.object
    }

    pub fn executable(&self) -> &Executable {
        &self.executable
    }

    pub fn run(
        &self,
        executor: &dyn StreamExecutor,
        arguments: &[&[u8]],
        profiler: &ExecutionProfiler,
    ) -> LoadResult<ExecutionOutput> {
        Ok(self.executable.execute(executor, arguments, profiler)?)
    }
}

use std::ffi::c_void;
use std::sync::Arc;

use crate::buffer_assignment::BufferSlice;
use crate::custom_call::CustomCallTargetRegistry;
use crate::executable::ExecutableInfo;
use crate::runtime::{BufferAllocations, DeviceMemory, ExecutionProfiler, Stream, StreamExecutor};

use super::{ExecutionError, ExecutionResult, Thunk, ThunkInfo, ThunkKind};

/// Calls a registered native routine with the addresses of its buffers.
///
/// The target is looked up in the registry on every execution, so routines
/// registered after compilation are picked up. The call runs as a host
/// callback on the stream and needs host-addressable memory. Execution reads
/// only immutable state.
#[derive(Debug)]
pub struct CustomCallThunk {
    info: ThunkInfo,
    target: String,
    opaque: Arc<[u8]>,
    operands: Vec<BufferSlice>,
    results: Vec<BufferSlice>,
    registry: &'static CustomCallTargetRegistry,
}

impl CustomCallThunk {
    pub fn new(
        info: ThunkInfo,
        target: impl Into<String>,
        opaque: Arc<[u8]>,
        operands: Vec<BufferSlice>,
        results: Vec<BufferSlice>,
    ) -> Self {
        Self {
            info,
            target: target.into(),
            opaque,
            operands,
            results,
            registry: CustomCallTargetRegistry::global(),
        }
    }

    /// Resolves symbols against `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: &'static CustomCallTargetRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Thunk for CustomCallThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::CustomCall
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        _executable: &ExecutableInfo,
        executor: &dyn StreamExecutor,
    ) -> ExecutionResult<()> {
        if !executor.is_host_addressable() {
            return Err(ExecutionError::Initialization {
                thunk: self.info.name.clone(),
                reason: format!(
                    "custom call '{}' needs host-addressable memory on {}",
                    self.target,
                    executor.platform_name()
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
        let _scope = profiler.scope(self.info.annotation(ThunkKind::CustomCall));
        let address = self
            .registry
            .lookup(&self.target)
            .filter(|address| !address.is_null())
            .ok_or_else(|| ExecutionError::UnresolvedSymbol(self.target.clone()))?;
        // SAFETY: registered custom call targets use the `CustomCallFn` calling convention.
        let function = unsafe { address.as_custom_call_fn() }
            .ok_or_else(|| ExecutionError::UnresolvedSymbol(self.target.clone()))?;

        let inputs = self
            .operands
            .iter()
            .map(|slice| buffers.device_address(*slice))
            .collect::<ExecutionResult<Vec<DeviceMemory>>>()?;
        let outputs = self
            .results
            .iter()
            .map(|slice| buffers.device_address(*slice))
            .collect::<ExecutionResult<Vec<DeviceMemory>>>()?;
        let opaque = Arc::clone(&self.opaque);

        stream.host_callback(Box::new(move || {
            let input_ptrs: Vec<*const c_void> =
                inputs.iter().map(|m| m.opaque() as *const c_void).collect();
            let output_ptrs: Vec<*mut c_void> = outputs.iter().map(|m| m.opaque()).collect();
            // SAFETY: every pointer names a live host-addressable buffer owned by this
            // execution; the routine follows the registered calling convention.
            unsafe {
                function(
                    output_ptrs.as_ptr(),
                    input_ptrs.as_ptr(),
                    opaque.as_ptr(),
                    opaque.len(),
                );
            }
            Ok(())
        }))?;
        Ok(())
    }
}

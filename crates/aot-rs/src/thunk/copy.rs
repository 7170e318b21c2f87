use crate::buffer_assignment::BufferSlice;
use crate::executable::ExecutableInfo;
use crate::hlo::Layout;
use crate::runtime::{BufferAllocations, ExecutionProfiler, Stream, StreamExecutor};

use super::{ExecutionError, ExecutionResult, Thunk, ThunkInfo, ThunkKind};

/// Element permutation between two physical layouts of the same logical array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayout {
    pub dims: Vec<usize>,
    pub element_bytes: usize,
    pub source: Layout,
    pub destination: Layout,
}

impl Relayout {
    pub fn byte_size(&self) -> usize {
        self.dims.iter().product::<usize>() * self.element_bytes
    }

    /// Writes `src`, stored with `source`, into `dst` using `destination`.
    ///
    /// # Panics
    ///
    /// Panics when either buffer is smaller than [`Relayout::byte_size`].
    pub fn apply(&self, src: &[u8], dst: &mut [u8]) {
        let total = self.byte_size();
        assert!(src.len() >= total && dst.len() >= total, "relayout buffer too small");
        if total == 0 {
            return;
        }
        let width = self.element_bytes;
        let mut index = vec![0usize; self.dims.len()];
        loop {
            let from = self.source.linear_offset(&self.dims, &index) * width;
            let to = self.destination.linear_offset(&self.dims, &index) * width;
            dst[to..to + width].copy_from_slice(&src[from..from + width]);

            let mut axis = self.dims.len();
            loop {
                if axis == 0 {
                    return;
                }
                axis -= 1;
                index[axis] += 1;
                if index[axis] < self.dims[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
    }
}

/// Copies one buffer into another, permuting elements when layouts differ.
///
/// Permuting copies run as host callbacks and need host-addressable memory.
#[derive(Debug)]
pub struct CopyThunk {
    info: ThunkInfo,
    source: BufferSlice,
    destination: BufferSlice,
    relayout: Option<Relayout>,
}

impl CopyThunk {
    pub fn new(
        info: ThunkInfo,
        source: BufferSlice,
        destination: BufferSlice,
        relayout: Option<Relayout>,
    ) -> Self {
        Self {
            info,
            source,
            destination,
            relayout,
        }
    }

    pub fn relayout(&self) -> Option<&Relayout> {
        self.relayout.as_ref()
    }
}

impl Thunk for CopyThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Copy
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        _executable: &ExecutableInfo,
        executor: &dyn StreamExecutor,
    ) -> ExecutionResult<()> {
        if self.relayout.is_some() && !executor.is_host_addressable() {
            return Err(ExecutionError::Initialization {
                thunk: self.info.name.clone(),
                reason: format!(
                    "layout-changing copy needs host-addressable memory on {}",
                    executor.platform_name()
                ),
            });
        }
        if self.source.size != self.destination.size {
            return Err(ExecutionError::Initialization {
                thunk: self.info.name.clone(),
                reason: format!(
                    "source has {} bytes, destination {}",
                    self.source.size, self.destination.size
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
        let _scope = profiler.scope(self.info.annotation(ThunkKind::Copy));
        let src = buffers.device_address(self.source)?;
        let dst = buffers.device_address(self.destination)?;
        match &self.relayout {
            None => stream.memcpy_device_to_device(dst, src, self.source.size)?,
            Some(relayout) => {
                let relayout = relayout.clone();
                stream.host_callback(Box::new(move || {
                    let size = relayout.byte_size();
                    if src.size() < size || dst.size() < size {
                        return Err(format!("relayout of {size} bytes exceeds buffers"));
                    }
                    // SAFETY: both regions are host-addressable (checked at init), at least
                    // `size` bytes long, and owned by this execution until the stream drains.
                    let (from, to) = unsafe {
                        (
                            std::slice::from_raw_parts(src.opaque().cast::<u8>(), size),
                            std::slice::from_raw_parts_mut(dst.opaque().cast::<u8>(), size),
                        )
                    };
                    relayout.apply(from, to);
                    Ok(())
                }))?;
            }
        }
        Ok(())
    }
}

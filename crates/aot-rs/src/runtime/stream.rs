use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("{platform}: out of device memory allocating {requested} bytes")]
    ResourceExhausted { platform: String, requested: usize },
    #[error("invalid stream argument: {0}")]
    InvalidArgument(String),
    #[error("host callback failed: {0}")]
    Callback(String),
    #[error("stream {0} is no longer running")]
    Disconnected(String),
    #[error("device error: {0}")]
    Device(String),
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Untyped handle to a region of device memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceMemory {
    opaque: *mut c_void,
    size: usize,
}

// SAFETY: the handle is an address plus a length; synchronization of the memory it
// names is the responsibility of the stream that reads or writes it.
unsafe impl Send for DeviceMemory {}
// SAFETY: see above.
unsafe impl Sync for DeviceMemory {}

impl DeviceMemory {
    pub fn new(opaque: *mut c_void, size: usize) -> Self {
        Self { opaque, size }
    }

    pub fn null() -> Self {
        Self {
            opaque: std::ptr::null_mut(),
            size: 0,
        }
    }

    pub fn opaque(&self) -> *mut c_void {
        self.opaque
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_null(&self) -> bool {
        self.opaque.is_null()
    }

    /// Sub-range `[offset, offset + size)` of this region.
    pub fn slice(&self, offset: usize, size: usize) -> StreamResult<DeviceMemory> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| StreamError::InvalidArgument("slice range overflows".into()))?;
        if end > self.size {
            return Err(StreamError::InvalidArgument(format!(
                "slice [{offset}, {end}) exceeds region of {} bytes",
                self.size
            )));
        }
        let base = self.opaque.cast::<u8>().wrapping_add(offset);
        Ok(DeviceMemory::new(base.cast::<c_void>(), size))
    }
}

impl fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceMemory({:p}, {} bytes)", self.opaque, self.size)
    }
}

pub type HostCallback = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// In-order queue of device work.
///
/// Enqueue methods return once the work is queued. Errors raised by queued work
/// surface from a later enqueue or from [`Stream::block_host_until_done`].
pub trait Stream: Send + Sync {
    fn name(&self) -> &str;

    fn memcpy_device_to_device(
        &self,
        dst: DeviceMemory,
        src: DeviceMemory,
        size: usize,
    ) -> StreamResult<()>;

    fn memcpy_host_to_device(&self, dst: DeviceMemory, data: Arc<[u8]>) -> StreamResult<()>;

    /// Waits for all prior work, then copies `dst.len()` bytes out of `src`.
    fn memcpy_device_to_host(&self, dst: &mut [u8], src: DeviceMemory) -> StreamResult<()>;

    fn memzero(&self, dst: DeviceMemory, size: usize) -> StreamResult<()>;

    /// Runs `callback` on the host once all prior work has completed.
    fn host_callback(&self, callback: HostCallback) -> StreamResult<()>;

    fn block_host_until_done(&self) -> StreamResult<()>;
}

/// Device-level services: memory and streams.
pub trait StreamExecutor: Send + Sync {
    fn platform_name(&self) -> &str;

    fn allocate(&self, size: usize) -> StreamResult<DeviceMemory>;

    fn deallocate(&self, memory: DeviceMemory);

    fn create_stream(&self) -> StreamResult<Box<dyn Stream>>;

    /// Device addresses can be dereferenced directly by host code.
    fn is_host_addressable(&self) -> bool;
}

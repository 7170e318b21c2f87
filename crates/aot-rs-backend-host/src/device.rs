//! Host-memory "device": aligned heap allocations and a worker-thread stream.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use aot_rs::runtime::{DeviceMemory, HostCallback, Stream, StreamError, StreamExecutor, StreamResult};
use tracing::{trace, warn};

const ALIGNMENT: usize = 64;
const PLATFORM: &str = "host";

/// Stream executor whose device memory is ordinary host memory.
pub struct HostStreamExecutor {
    live: Mutex<HashMap<usize, Layout>>,
    bytes_in_use: AtomicUsize,
    memory_limit: Option<usize>,
    streams_created: AtomicUsize,
}

impl HostStreamExecutor {
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            bytes_in_use: AtomicUsize::new(0),
            memory_limit: None,
            streams_created: AtomicUsize::new(0),
        }
    }

    /// Fails allocations once `limit` bytes are outstanding.
    pub fn with_memory_limit(limit: usize) -> Self {
        let mut executor = Self::new();
        executor.memory_limit = Some(limit);
        executor
    }

    pub fn bytes_in_use(&self) -> usize {
        self.bytes_in_use.load(Ordering::Acquire)
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().expect("host allocator mutex poisoned").len()
    }
}

impl Default for HostStreamExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HostStreamExecutor {
    fn drop(&mut self) {
        let live = std::mem::take(&mut *self.live.lock().expect("host allocator mutex poisoned"));
        if !live.is_empty() {
            warn!(allocations = live.len(), "host executor dropped with live allocations");
        }
        for (address, layout) in live {
            // SAFETY: every entry was produced by `alloc_zeroed` with this layout.
            unsafe { alloc::dealloc(address as *mut u8, layout) };
        }
    }
}

impl StreamExecutor for HostStreamExecutor {
    fn platform_name(&self) -> &str {
        PLATFORM
    }

    fn allocate(&self, size: usize) -> StreamResult<DeviceMemory> {
        let exhausted = || StreamError::ResourceExhausted {
            platform: PLATFORM.to_string(),
            requested: size,
        };
        let limit = self.memory_limit.unwrap_or(usize::MAX);
        self.bytes_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |in_use| {
                in_use.checked_add(size).filter(|total| *total <= limit)
            })
            .map_err(|_| exhausted())?;

        let layout = match Layout::from_size_align(size.max(1), ALIGNMENT) {
            Ok(layout) => layout,
            Err(err) => {
                self.bytes_in_use.fetch_sub(size, Ordering::AcqRel);
                return Err(StreamError::InvalidArgument(err.to_string()));
            }
        };
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            self.bytes_in_use.fetch_sub(size, Ordering::AcqRel);
            return Err(exhausted());
        }
        self.live
            .lock()
            .expect("host allocator mutex poisoned")
            .insert(ptr as usize, layout);
        trace!(size, address = ?ptr, "host allocation");
        Ok(DeviceMemory::new(ptr.cast::<c_void>(), size))
    }

    fn deallocate(&self, memory: DeviceMemory) {
        let layout = self
            .live
            .lock()
            .expect("host allocator mutex poisoned")
            .remove(&(memory.opaque() as usize));
        let Some(layout) = layout else {
            warn!(?memory, "deallocating unknown host buffer");
            return;
        };
        self.bytes_in_use.fetch_sub(memory.size(), Ordering::AcqRel);
        // SAFETY: the address was allocated with `layout` and is removed from the live set.
        unsafe { alloc::dealloc(memory.opaque().cast::<u8>(), layout) };
    }

    fn create_stream(&self) -> StreamResult<Box<dyn Stream>> {
        let id = self.streams_created.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(HostStream::spawn(format!("host-stream-{id}"))?))
    }

    fn is_host_addressable(&self) -> bool {
        true
    }
}

enum Command {
    Work(HostCallback),
    Fence(Sender<()>),
}

/// In-order stream served by one worker thread.
///
/// The first failing item puts the stream into an error state: queued work
/// after it is skipped, and every later enqueue or synchronization reports
/// that error.
pub struct HostStream {
    name: String,
    sender: Mutex<Option<Sender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    error: Arc<Mutex<Option<String>>>,
}

impl HostStream {
    pub fn spawn(name: String) -> StreamResult<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let error = Arc::new(Mutex::new(None));
        let worker_error = Arc::clone(&error);
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(receiver, worker_error))
            .map_err(|err| StreamError::Device(format!("failed to spawn stream worker: {err}")))?;
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            error,
        })
    }

    fn check_error(&self) -> StreamResult<()> {
        match self.error.lock().expect("stream error mutex poisoned").as_ref() {
            Some(message) => Err(StreamError::Callback(message.clone())),
            None => Ok(()),
        }
    }

    fn send(&self, command: Command) -> StreamResult<()> {
        let sender = self.sender.lock().expect("stream sender mutex poisoned");
        let sender = sender
            .as_ref()
            .ok_or_else(|| StreamError::Disconnected(self.name.clone()))?;
        sender
            .send(command)
            .map_err(|_| StreamError::Disconnected(self.name.clone()))
    }

    fn enqueue(&self, work: HostCallback) -> StreamResult<()> {
        self.check_error()?;
        self.send(Command::Work(work))
    }
}

fn run_worker(receiver: Receiver<Command>, error: Arc<Mutex<Option<String>>>) {
    while let Ok(command) = receiver.recv() {
        match command {
            Command::Work(work) => {
                if error.lock().expect("stream error mutex poisoned").is_some() {
                    continue;
                }
                if let Err(message) = work() {
                    warn!(error = %message, "host stream work failed");
                    *error.lock().expect("stream error mutex poisoned") = Some(message);
                }
            }
            Command::Fence(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

fn check_range(memory: DeviceMemory, size: usize, what: &str) -> Result<(), String> {
    if size > memory.size() {
        return Err(format!(
            "{what} of {size} bytes exceeds buffer of {} bytes",
            memory.size()
        ));
    }
    if memory.is_null() && size > 0 {
        return Err(format!("{what} on null buffer"));
    }
    Ok(())
}

impl Stream for HostStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn memcpy_device_to_device(
        &self,
        dst: DeviceMemory,
        src: DeviceMemory,
        size: usize,
    ) -> StreamResult<()> {
        self.enqueue(Box::new(move || {
            check_range(src, size, "memcpy source")?;
            check_range(dst, size, "memcpy destination")?;
            if size == 0 {
                return Ok(());
            }
            // SAFETY: both ranges were checked against their buffers; `copy` tolerates overlap.
            unsafe {
                std::ptr::copy(
                    src.opaque().cast::<u8>().cast_const(),
                    dst.opaque().cast::<u8>(),
                    size,
                )
            };
            Ok(())
        }))
    }

    fn memcpy_host_to_device(&self, dst: DeviceMemory, data: Arc<[u8]>) -> StreamResult<()> {
        self.enqueue(Box::new(move || {
            check_range(dst, data.len(), "upload")?;
            if data.is_empty() {
                return Ok(());
            }
            // SAFETY: the destination range was checked; host data never aliases device buffers.
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), dst.opaque().cast::<u8>(), data.len())
            };
            Ok(())
        }))
    }

    fn memcpy_device_to_host(&self, dst: &mut [u8], src: DeviceMemory) -> StreamResult<()> {
        self.block_host_until_done()?;
        check_range(src, dst.len(), "download").map_err(StreamError::InvalidArgument)?;
        if dst.is_empty() {
            return Ok(());
        }
        // SAFETY: the stream is drained and the source range was checked.
        unsafe {
            std::ptr::copy_nonoverlapping(
                src.opaque().cast::<u8>().cast_const(),
                dst.as_mut_ptr(),
                dst.len(),
            )
        };
        Ok(())
    }

    fn memzero(&self, dst: DeviceMemory, size: usize) -> StreamResult<()> {
        self.enqueue(Box::new(move || {
            check_range(dst, size, "memzero")?;
            if size > 0 {
                // SAFETY: the range was checked against the buffer.
                unsafe { std::ptr::write_bytes(dst.opaque().cast::<u8>(), 0, size) };
            }
            Ok(())
        }))
    }

    fn host_callback(&self, callback: HostCallback) -> StreamResult<()> {
        self.enqueue(callback)
    }

    fn block_host_until_done(&self) -> StreamResult<()> {
        let (ack, done) = mpsc::channel();
        self.send(Command::Fence(ack))?;
        done.recv()
            .map_err(|_| StreamError::Disconnected(self.name.clone()))?;
        self.check_error()
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!(stream = %self.name, "host stream worker panicked");
            }
        }
    }
}

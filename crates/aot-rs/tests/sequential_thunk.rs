use std::sync::{Arc, Mutex};

use aot_rs::hlo::{ComputationBuilder, Shape};
use aot_rs::runtime::{
    BufferAllocations, DeviceMemory, ExecutionProfiler, HostCallback, Stream, StreamExecutor,
    StreamResult,
};
use aot_rs::thunk::{ExecutionError, ExecutionResult, SequentialThunk, Thunk, ThunkInfo, ThunkKind};
use aot_rs::{ElementType, ExecutableInfo};

type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
struct RecordingThunk {
    info: ThunkInfo,
    journal: Journal,
    fail_initialize: bool,
    fail_execute: bool,
}

impl RecordingThunk {
    fn boxed(name: &str, journal: &Journal) -> Box<dyn Thunk> {
        Box::new(Self {
            info: ThunkInfo::new(None, name),
            journal: Arc::clone(journal),
            fail_initialize: false,
            fail_execute: false,
        })
    }

    fn failing_execute(name: &str, journal: &Journal) -> Box<dyn Thunk> {
        Box::new(Self {
            info: ThunkInfo::new(None, name),
            journal: Arc::clone(journal),
            fail_initialize: false,
            fail_execute: true,
        })
    }

    fn failing_initialize(name: &str, journal: &Journal) -> Box<dyn Thunk> {
        Box::new(Self {
            info: ThunkInfo::new(None, name),
            journal: Arc::clone(journal),
            fail_initialize: true,
            fail_execute: false,
        })
    }

    fn log(&self, event: &str) {
        self.journal
            .lock()
            .expect("journal poisoned")
            .push(format!("{event}:{}", self.info.name));
    }
}

impl Thunk for RecordingThunk {
    fn kind(&self) -> ThunkKind {
        ThunkKind::Copy
    }

    fn info(&self) -> &ThunkInfo {
        &self.info
    }

    fn initialize(
        &mut self,
        _executable: &ExecutableInfo,
        _executor: &dyn StreamExecutor,
    ) -> ExecutionResult<()> {
        self.log("init");
        if self.fail_initialize {
            return Err(ExecutionError::Initialization {
                thunk: self.info.name.clone(),
                reason: "refused".into(),
            });
        }
        Ok(())
    }

    fn execute_on_stream(
        &self,
        _buffers: &BufferAllocations<'_>,
        _stream: &dyn Stream,
        profiler: &ExecutionProfiler,
    ) -> ExecutionResult<()> {
        let _scope = profiler.scope(self.info.annotation(self.kind()));
        self.log("exec");
        if self.fail_execute {
            return Err(ExecutionError::failed(&self.info.name, "boom"));
        }
        Ok(())
    }
}

struct NullStream;

impl Stream for NullStream {
    fn name(&self) -> &str {
        "null"
    }

    fn memcpy_device_to_device(&self, _: DeviceMemory, _: DeviceMemory, _: usize) -> StreamResult<()> {
        Ok(())
    }

    fn memcpy_host_to_device(&self, _: DeviceMemory, _: Arc<[u8]>) -> StreamResult<()> {
        Ok(())
    }

    fn memcpy_device_to_host(&self, _: &mut [u8], _: DeviceMemory) -> StreamResult<()> {
        Ok(())
    }

    fn memzero(&self, _: DeviceMemory, _: usize) -> StreamResult<()> {
        Ok(())
    }

    fn host_callback(&self, callback: HostCallback) -> StreamResult<()> {
        callback().map_err(aot_rs::runtime::StreamError::Callback)
    }

    fn block_host_until_done(&self) -> StreamResult<()> {
        Ok(())
    }
}

struct NullExecutor;

impl StreamExecutor for NullExecutor {
    fn platform_name(&self) -> &str {
        "null"
    }

    fn allocate(&self, size: usize) -> StreamResult<DeviceMemory> {
        Ok(DeviceMemory::new(std::ptr::null_mut(), size))
    }

    fn deallocate(&self, _memory: DeviceMemory) {}

    fn create_stream(&self) -> StreamResult<Box<dyn Stream>> {
        Ok(Box::new(NullStream))
    }

    fn is_host_addressable(&self) -> bool {
        false
    }
}

fn executable_info() -> anyhow::Result<ExecutableInfo> {
    let mut b = ComputationBuilder::new("identity");
    let x = b.parameter(0, Shape::array(ElementType::F32, vec![4]))?;
    Ok(ExecutableInfo::from_computation(&b.build(x)?)?)
}

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().expect("journal poisoned").clone()
}

#[test]
fn children_run_once_in_construction_order() -> anyhow::Result<()> {
    let journal = Journal::default();
    let mut seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![
            RecordingThunk::boxed("a", &journal),
            RecordingThunk::boxed("b", &journal),
            RecordingThunk::boxed("c", &journal),
        ],
    );
    seq.initialize(&executable_info()?, &NullExecutor)?;
    assert!(seq.is_initialized());
    journal.lock().expect("journal poisoned").clear();

    let buffers = BufferAllocations::from_buffers(Vec::new());
    seq.execute_on_stream(&buffers, &NullStream, &ExecutionProfiler::disabled())?;
    assert_eq!(entries(&journal), vec!["exec:a", "exec:b", "exec:c"]);
    Ok(())
}

#[test]
fn failing_child_stops_the_sequence() -> anyhow::Result<()> {
    let journal = Journal::default();
    let mut seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![
            RecordingThunk::boxed("a", &journal),
            RecordingThunk::failing_execute("b", &journal),
            RecordingThunk::boxed("c", &journal),
        ],
    );
    seq.initialize(&executable_info()?, &NullExecutor)?;
    journal.lock().expect("journal poisoned").clear();

    let buffers = BufferAllocations::from_buffers(Vec::new());
    let err = seq
        .execute_on_stream(&buffers, &NullStream, &ExecutionProfiler::disabled())
        .unwrap_err();
    assert_eq!(err, ExecutionError::failed("b", "boom"));
    assert_eq!(entries(&journal), vec!["exec:a", "exec:b"]);
    Ok(())
}

#[test]
fn initialization_stops_at_first_failure() -> anyhow::Result<()> {
    let journal = Journal::default();
    let mut seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![
            RecordingThunk::boxed("a", &journal),
            RecordingThunk::failing_initialize("b", &journal),
            RecordingThunk::boxed("c", &journal),
        ],
    );
    let err = seq
        .initialize(&executable_info()?, &NullExecutor)
        .unwrap_err();
    assert!(matches!(err, ExecutionError::Initialization { ref thunk, .. } if thunk == "b"));
    assert_eq!(entries(&journal), vec!["init:a", "init:b"]);
    assert!(!seq.is_initialized());
    Ok(())
}

#[test]
fn executing_before_initialize_is_an_error() {
    let journal = Journal::default();
    let seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![RecordingThunk::boxed("a", &journal)],
    );
    let buffers = BufferAllocations::from_buffers(Vec::new());
    let err = seq
        .execute_on_stream(&buffers, &NullStream, &ExecutionProfiler::disabled())
        .unwrap_err();
    assert!(matches!(err, ExecutionError::NotInitialized(_)));
    assert!(entries(&journal).is_empty());
}

#[test]
fn repeated_execution_after_one_initialize() -> anyhow::Result<()> {
    let journal = Journal::default();
    let mut seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![RecordingThunk::boxed("a", &journal), RecordingThunk::boxed("b", &journal)],
    );
    seq.initialize(&executable_info()?, &NullExecutor)?;
    let buffers = BufferAllocations::from_buffers(Vec::new());
    for _ in 0..3 {
        seq.execute_on_stream(&buffers, &NullStream, &ExecutionProfiler::disabled())?;
    }
    let execs = entries(&journal)
        .into_iter()
        .filter(|e| e.starts_with("exec:"))
        .count();
    assert_eq!(execs, 6);
    Ok(())
}

#[test]
fn sequence_opens_one_scope_around_its_children() -> anyhow::Result<()> {
    let journal = Journal::default();
    let mut seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![RecordingThunk::boxed("a", &journal), RecordingThunk::boxed("b", &journal)],
    );
    seq.initialize(&executable_info()?, &NullExecutor)?;
    let profiler = ExecutionProfiler::new(true);
    let buffers = BufferAllocations::from_buffers(Vec::new());
    seq.execute_on_stream(&buffers, &NullStream, &profiler)?;
    seq.execute_on_stream(&buffers, &NullStream, &profiler)?;

    let report = profiler.take_report();
    let outer = report.row("sequential:seq").expect("sequence scope");
    assert_eq!(outer.calls, 2);
    assert!(outer.inclusive_ms >= outer.exclusive_ms);
    assert_eq!(report.row("copy:a").map(|r| r.calls), Some(2));
    assert_eq!(report.row("copy:b").map(|r| r.calls), Some(2));
    Ok(())
}

#[test]
fn disabled_profiler_records_nothing() -> anyhow::Result<()> {
    let journal = Journal::default();
    let mut seq = SequentialThunk::new(
        ThunkInfo::new(None, "seq"),
        vec![RecordingThunk::boxed("a", &journal)],
    );
    seq.initialize(&executable_info()?, &NullExecutor)?;
    let profiler = ExecutionProfiler::disabled();
    let buffers = BufferAllocations::from_buffers(Vec::new());
    seq.execute_on_stream(&buffers, &NullStream, &profiler)?;
    assert!(profiler.take_report().is_empty());
    Ok(())
}

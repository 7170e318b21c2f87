use std::ffi::c_void;
use std::sync::Arc;

use aot_rs::aot::{
    AotCompilationInstance, AotCompilationOptions, AotError, CompileOnlyClient, DebugOptions,
    ServiceError,
};
use aot_rs::custom_call::register_custom_call;
use aot_rs::hlo::{
    bytes_to_f32s, f32s_to_bytes, BuildError, Computation, ComputationBuilder, CustomCallSpec,
    InstructionId, Layout, Literal, Opcode, Shape,
};
use aot_rs::runtime::ExecutionProfiler;
use aot_rs::ElementType;
use aot_rs_backend_host::{
    host_target_triple, ArtifactError, HostCompilationService, HostExecutable,
    HostStreamExecutor, HostTargetFeatures, LoadError, ObjectFile,
};

fn options() -> AotCompilationOptions {
    AotCompilationOptions::new(host_target_triple(), "entry")
        .with_debug_options(DebugOptions::default())
}

fn client(service: HostCompilationService) -> CompileOnlyClient {
    CompileOnlyClient::new(service.into_shared())
}

fn f32s(dims: &[usize]) -> Shape {
    Shape::array(ElementType::F32, dims.to_vec())
}

fn row_major(dims: &[usize]) -> Shape {
    Shape::array_with_layout(ElementType::F32, dims.to_vec(), Layout::descending(dims.len()))
}

fn column_major(dims: &[usize]) -> Shape {
    Shape::array_with_layout(ElementType::F32, dims.to_vec(), Layout::ascending(dims.len()))
}

fn compile_one(
    service: HostCompilationService,
    instance: AotCompilationInstance<'_>,
) -> anyhow::Result<Vec<u8>> {
    let output = client(service).compile_ahead_of_time(&[instance], &options())?;
    Ok(output.results[0].object_file.clone())
}

fn run_f32(object: &[u8], arguments: &[Vec<f32>]) -> anyhow::Result<Vec<Vec<f32>>> {
    let executor = HostStreamExecutor::new();
    let loaded = HostExecutable::load(object, &host_target_triple(), &executor)?;
    let bytes: Vec<Vec<u8>> = arguments.iter().map(|a| f32s_to_bytes(a)).collect();
    let views: Vec<&[u8]> = bytes.iter().map(|b| b.as_slice()).collect();
    let output = loaded.run(&executor, &views, &ExecutionProfiler::disabled())?;
    assert_eq!(executor.live_allocations(), 0, "execution must release its buffers");
    Ok(output.leaves.iter().map(|leaf| bytes_to_f32s(&leaf.bytes)).collect())
}

fn matmul_reference(lhs: &[f32], rhs: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|p| lhs[i * k + p] * rhs[p * n + j]).sum();
        }
    }
    out
}

fn transpose(values: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; values.len()];
    for r in 0..rows {
        for c in 0..cols {
            out[c * rows + r] = values[r * cols + c];
        }
    }
    out
}

fn wide_concat(count: usize) -> anyhow::Result<Computation> {
    let mut b = ComputationBuilder::new("wide");
    let params = (0..count)
        .map(|i| b.parameter(i, f32s(&[2, i % 3 + 1])))
        .collect::<Result<Vec<_>, _>>()?;
    let concat = b.concatenate(&params, 1)?;
    Ok(b.build(concat)?)
}

fn wide_arguments(count: usize) -> Vec<Vec<f32>> {
    (0..count)
        .map(|i| {
            let len = 2 * (i % 3 + 1);
            (0..len).map(|j| (i * 10 + j) as f32).collect()
        })
        .collect()
}

#[test]
fn concatenate_with_constant_runs() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("cat");
    let x = b.parameter(0, f32s(&[2, 2]))?;
    let k = b.constant(Literal::from_f32(vec![2, 1], &[9.0, 8.0]))?;
    let cat = b.concatenate(&[x, k], 1)?;
    let computation = b.build(cat)?;

    let object = compile_one(
        HostCompilationService::new(HostTargetFeatures::new(true)),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let out = run_f32(&object, &[vec![1.0, 2.0, 3.0, 4.0]])?;
    assert_eq!(out, vec![vec![1.0, 2.0, 9.0, 3.0, 4.0, 8.0]]);
    Ok(())
}

#[test]
fn dot_matches_reference_for_both_feature_settings() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("mm");
    let x = b.parameter(0, f32s(&[2, 3]))?;
    let y = b.parameter(1, f32s(&[3, 2]))?;
    let dot = b.dot(x, y)?;
    let computation = b.build(dot)?;

    let lhs = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let rhs = vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
    let expected = matmul_reference(&lhs, &rhs, 2, 3, 2);

    // lhs arrives column-major; the library path relayouts it, the strided path reads it as is
    let instance = AotCompilationInstance::new(
        &computation,
        vec![column_major(&[2, 3]), row_major(&[3, 2])],
        row_major(&[2, 2]),
    );
    let lhs_physical = transpose(&lhs, 2, 3);
    for library in [true, false] {
        let object = compile_one(
            HostCompilationService::new(HostTargetFeatures::new(library)),
            instance.clone(),
        )?;
        let out = run_f32(&object, &[lhs_physical.clone(), rhs.clone()])?;
        assert_eq!(out, vec![expected.clone()], "library matmul {library}");
    }
    Ok(())
}

#[test]
fn column_major_result_is_relayouted() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("cat_cm");
    let x = b.parameter(0, f32s(&[2, 2]))?;
    let y = b.parameter(1, f32s(&[2, 1]))?;
    let cat = b.concatenate(&[x, y], 1)?;
    let computation = b.build(cat)?;

    let instance = AotCompilationInstance::new(
        &computation,
        vec![row_major(&[2, 2]), row_major(&[2, 1])],
        column_major(&[2, 3]),
    );
    let object = compile_one(HostCompilationService::default(), instance)?;
    let out = run_f32(&object, &[vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0]])?;
    let logical = vec![1.0, 2.0, 5.0, 3.0, 4.0, 6.0];
    assert_eq!(out, vec![transpose(&logical, 2, 3)]);
    Ok(())
}

unsafe extern "C" fn add_one_f32(
    outputs: *const *mut c_void,
    inputs: *const *const c_void,
    opaque: *const u8,
    opaque_len: usize,
) {
    let payload = std::slice::from_raw_parts(opaque, opaque_len);
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[..8]);
    let len = u64::from_le_bytes(raw) as usize;
    let input = std::slice::from_raw_parts(*inputs as *const f32, len);
    let output = std::slice::from_raw_parts_mut(*outputs as *mut f32, len);
    for (o, i) in output.iter_mut().zip(input) {
        *o = *i + 1.0;
    }
}

#[test]
fn custom_call_resolves_through_registry() -> anyhow::Result<()> {
    register_custom_call("host_test_add_one_f32", add_one_f32);

    let mut b = ComputationBuilder::new("plus_one");
    let x = b.parameter(0, f32s(&[4]))?;
    let spec = CustomCallSpec::new("host_test_add_one_f32").with_opaque(4u64.to_le_bytes().to_vec());
    let call = b.custom_call(spec, &[x], f32s(&[4]))?;
    let computation = b.build(call)?;

    let output = client(HostCompilationService::default()).compile_ahead_of_time(
        &[AotCompilationInstance::with_default_layouts(&computation)],
        &options(),
    )?;
    let metadata = output.metadata.expect("metadata");
    assert!(metadata.custom_call_targets.contains("host_test_add_one_f32"));

    let out = run_f32(&output.results[0].object_file, &[vec![1.0, 2.0, 3.0, 4.0]])?;
    assert_eq!(out, vec![vec![2.0, 3.0, 4.0, 5.0]]);
    Ok(())
}

#[test]
fn unregistered_custom_call_fails_at_execution() -> anyhow::Result<()> {
    let mut b = ComputationBuilder::new("missing");
    let x = b.parameter(0, f32s(&[2]))?;
    let call = b.custom_call(CustomCallSpec::new("host_test_never_registered"), &[x], f32s(&[2]))?;
    let computation = b.build(call)?;
    let object = compile_one(
        HostCompilationService::default(),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let err = run_f32(&object, &[vec![1.0, 2.0]]).unwrap_err();
    let err = err.downcast::<LoadError>()?;
    assert!(err.to_string().contains("host_test_never_registered"), "{err}");
    Ok(())
}

#[test]
fn split_concatenate_matches_unsplit_result() -> anyhow::Result<()> {
    const COUNT: usize = 23;
    let computation = wide_concat(COUNT)?;
    let arguments = wide_arguments(COUNT);

    let wide = compile_one(
        HostCompilationService::default().with_max_operands(64),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let narrow = compile_one(
        HostCompilationService::default().with_max_operands(3),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;

    let narrow_object = ObjectFile::from_bytes(&narrow)?;
    assert!(narrow_object
        .computation
        .instructions()
        .iter()
        .all(|inst| inst.operands.len() <= 3));
    assert!(narrow_object.computation.len() > computation.len());

    assert_eq!(run_f32(&wide, &arguments)?, run_f32(&narrow, &arguments)?);
    Ok(())
}

#[test]
fn batch_artifacts_keep_input_order() -> anyhow::Result<()> {
    let a = wide_concat(2)?;
    let mut b = ComputationBuilder::new("copy");
    let x = b.parameter(0, f32s(&[3]))?;
    let y = b.copy(x)?;
    let copy = b.build(y)?;

    let output = client(HostCompilationService::default()).compile_ahead_of_time(
        &[
            AotCompilationInstance::with_default_layouts(&copy),
            AotCompilationInstance::with_default_layouts(&a),
        ],
        &options(),
    )?;
    assert_eq!(output.results.len(), 2);
    assert_eq!(output.results[0].module_name, "copy");
    assert_eq!(output.results[1].module_name, "wide");
    assert_ne!(output.results[0].entry_point, output.results[1].entry_point);
    assert!(output.results[0].entry_point.starts_with("entry__copy__"));
    Ok(())
}

#[test]
fn unsupported_target_fails_the_batch() -> anyhow::Result<()> {
    let computation = wide_concat(2)?;
    let options = AotCompilationOptions::new("riscv64gc-unknown-linux-gnu", "entry")
        .with_debug_options(DebugOptions::default());
    let err = client(HostCompilationService::default())
        .compile_ahead_of_time(
            &[AotCompilationInstance::with_default_layouts(&computation)],
            &options,
        )
        .unwrap_err();
    assert!(matches!(
        err,
        AotError::Service(ServiceError::UnsupportedTarget(_))
    ));
    Ok(())
}

#[test]
fn loader_rejects_foreign_targets_and_versions() -> anyhow::Result<()> {
    let computation = wide_concat(2)?;
    let bytes = compile_one(
        HostCompilationService::default(),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let executor = HostStreamExecutor::new();

    let err = HostExecutable::load(&bytes, "aarch64-unknown-none", &executor).unwrap_err();
    if host_target_triple() != "aarch64-unknown-none" {
        assert!(matches!(
            err,
            LoadError::Artifact(ArtifactError::TargetMismatch { .. })
        ));
    }

    let mut object = ObjectFile::from_bytes(&bytes)?;
    object.version += 1;
    let err = HostExecutable::load(&object.to_bytes()?, &host_target_triple(), &executor)
        .unwrap_err();
    assert!(matches!(
        err,
        LoadError::Artifact(ArtifactError::Version { .. })
    ));

    let err = HostExecutable::load(b"garbage", &host_target_triple(), &executor).unwrap_err();
    assert!(matches!(err, LoadError::Artifact(_)));
    Ok(())
}

#[test]
fn loader_rejects_malformed_computations() -> anyhow::Result<()> {
    let computation = wide_concat(2)?;
    let bytes = compile_one(
        HostCompilationService::default(),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let executor = HostStreamExecutor::new();

    let mut object = ObjectFile::from_bytes(&bytes)?;
    object.computation.set_root(InstructionId(999));
    let err = HostExecutable::load(&object.to_bytes()?, &host_target_triple(), &executor)
        .unwrap_err();
    assert!(matches!(
        err,
        LoadError::Artifact(ArtifactError::Invalid(BuildError::UnknownOperand(InstructionId(999))))
    ));

    let mut object = ObjectFile::from_bytes(&bytes)?;
    let param = object.computation.parameters()[0].id;
    let dot = object
        .computation
        .push("bad-dot", Opcode::Dot, vec![param, param], f32s(&[2, 2]));
    object.computation.set_root(dot);
    let err = HostExecutable::load(&object.to_bytes()?, &host_target_triple(), &executor)
        .unwrap_err();
    assert!(matches!(
        err,
        LoadError::Artifact(ArtifactError::Invalid(BuildError::Invalid { op: "dot", .. }))
    ));
    assert_eq!(executor.live_allocations(), 0);
    Ok(())
}

#[test]
fn wrong_argument_size_is_rejected() -> anyhow::Result<()> {
    let computation = wide_concat(2)?;
    let bytes = compile_one(
        HostCompilationService::default(),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let err = run_f32(&bytes, &[vec![1.0, 2.0], vec![3.0]]).unwrap_err();
    assert!(err.downcast_ref::<LoadError>().is_some());
    Ok(())
}

#[test]
fn profiler_sees_every_thunk() -> anyhow::Result<()> {
    let computation = wide_concat(3)?;
    let bytes = compile_one(
        HostCompilationService::default(),
        AotCompilationInstance::with_default_layouts(&computation),
    )?;
    let executor = HostStreamExecutor::new();
    let loaded = HostExecutable::load(&bytes, &host_target_triple(), &executor)?;
    let arguments: Vec<Vec<u8>> = wide_arguments(3).iter().map(|a| f32s_to_bytes(a)).collect();
    let views: Vec<&[u8]> = arguments.iter().map(|a| a.as_slice()).collect();
    let profiler = ExecutionProfiler::new(true);
    loaded.run(&executor, &views, &profiler)?;

    let report = profiler.take_report();
    assert_eq!(report.row("sequential:wide").map(|r| r.calls), Some(1));
    assert!(report.rows.iter().any(|r| r.annotation.starts_with("concatenate:")));
    Ok(())
}

#[test]
fn artifacts_are_shareable_across_threads() -> anyhow::Result<()> {
    let computation = wide_concat(4)?;
    let bytes = Arc::new(compile_one(
        HostCompilationService::default(),
        AotCompilationInstance::with_default_layouts(&computation),
    )?);
    let arguments = wide_arguments(4);
    let expected = run_f32(&bytes, &arguments)?;
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bytes = Arc::clone(&bytes);
            let arguments = arguments.clone();
            std::thread::spawn(move || run_f32(&bytes, &arguments).map_err(|e| e.to_string()))
        })
        .collect();
    for handle in handles {
        let out = handle.join().expect("thread panicked").map_err(anyhow::Error::msg)?;
        assert_eq!(out, expected);
    }
    Ok(())
}

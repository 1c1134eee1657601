//! End-to-end run sequences over the simulated backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kernel_runner_backends::{Backend, BuildRequest, DeviceSelection};
use kernel_runner_common::{
    BufferBasePaths, Ecosystem, ErrorKind, KernelIdentity, LaunchConfigComponents, Result,
    RunOptions, RunnerError, ScalarKind,
};
use kernel_runner_core::{
    buffers, AdapterRegistry, ExecutionContext, KernelAdapter, MemoryIo, Orchestrator,
    ParameterDetails, PreprocessorDefinitionDetails, RunOutcome, SizeCalculator, SizeInputs,
};
use kernel_runner_test_support::{KernelInvocation, Operation, SimulatedBackend};

// ── test adapters ───────────────────────────────────────────────────────────

#[derive(Default)]
struct Accumulate;

static ACCUMULATE_PARAMS: [ParameterDetails; 3] = [
    ParameterDetails::inout_buffer("acc", "accumulator, incremented in place"),
    ParameterDetails::input_buffer("delta", "per-element increment"),
    ParameterDetails::output_buffer(
        "snapshot",
        SizeCalculator::SameAsInput("delta"),
        "the accumulator after the increment",
    ),
];

impl KernelAdapter for Accumulate {
    fn key(&self) -> &'static str {
        "accumulate"
    }

    fn parameter_details(&self) -> &[ParameterDetails] {
        &ACCUMULATE_PARAMS
    }
}

fn accumulate_kernel(inv: &mut KernelInvocation<'_>) -> Result<()> {
    let delta = inv.read("delta")?;
    for (a, d) in inv.write("acc")?.iter_mut().zip(&delta) {
        *a = a.wrapping_add(*d);
    }
    let acc = inv.read("acc")?;
    // Writes only the first half, so stale data shows without zero-fill.
    let snapshot = inv.write("snapshot")?;
    let half = snapshot.len() / 2;
    snapshot[..half].copy_from_slice(&acc[..half]);
    Ok(())
}

#[derive(Default)]
struct Padded;

fn padded_size(inputs: &SizeInputs<'_>) -> Result<usize> {
    Ok(inputs.scalar::<u32>("count")? as usize * 4)
}

static PADDED_PARAMS: [ParameterDetails; 2] = [
    ParameterDetails::output_buffer("data", SizeCalculator::Custom(padded_size), "filled words"),
    ParameterDetails::scalar("count", ScalarKind::U32, true, "number of words"),
];

static PADDED_DEFINITIONS: [PreprocessorDefinitionDetails; 1] =
    [PreprocessorDefinitionDetails::required("FILL_VALUE", "word written to every element")];

impl KernelAdapter for Padded {
    fn key(&self) -> &'static str {
        "padded"
    }

    fn entry_point_name(&self) -> &'static str {
        "padded_fill"
    }

    fn parameter_details(&self) -> &[ParameterDetails] {
        &PADDED_PARAMS
    }

    fn preprocessor_definition_details(&self) -> &[PreprocessorDefinitionDetails] {
        &PADDED_DEFINITIONS
    }

    fn deduce_launch_config(&self, context: &ExecutionContext) -> Result<LaunchConfigComponents> {
        let count = context.scalar::<u32>("count")?;
        Ok(LaunchConfigComponents {
            block: Some([32, 1, 1]),
            overall: Some([count, 1, 1]),
            ..LaunchConfigComponents::default()
        })
    }
}

fn registry() -> AdapterRegistry {
    let mut registry = AdapterRegistry::new();
    registry.register_adapter::<Accumulate>().unwrap();
    registry.register_adapter::<Padded>().unwrap();
    registry
}

fn options(key: &str) -> RunOptions {
    RunOptions {
        kernel: KernelIdentity {
            key: key.to_string(),
            function_name: None,
            source_file: PathBuf::from("kernels/k.cu"),
        },
        buffer_base_paths: BufferBasePaths { input: "in".into(), output: "out".into() },
        ..RunOptions::default()
    }
}

fn accumulate_options(runs: u32) -> RunOptions {
    RunOptions {
        num_runs: runs,
        forced_launch_config: LaunchConfigComponents::forced(
            Some([4, 1, 1]),
            None,
            Some([8, 1, 1]),
            None,
        )
        .unwrap(),
        ..options("accumulate")
    }
}

fn accumulate_io() -> MemoryIo {
    MemoryIo::new()
        .with_file("kernels/k.cu", "__global__ void accumulate() {}")
        .with_file("in/acc", vec![1u8; 8])
        .with_file("in/delta", vec![2u8; 8])
}

fn padded_options() -> RunOptions {
    let mut opts = options("padded");
    opts.scalar_arguments.insert("count".into(), "3".into());
    opts.preprocessor_definitions.push("FILL_VALUE=7".into());
    opts
}

fn padded_io() -> MemoryIo {
    MemoryIo::new().with_file("kernels/k.cu", "__global__ void padded_fill() {}")
}

/// A factory that records whether a backend was ever requested.
fn tracking_factory(
    backend: SimulatedBackend,
) -> (Arc<AtomicBool>, impl Fn(&DeviceSelection) -> Result<Box<dyn Backend>>) {
    let opened = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&opened);
    let inner = backend.into_factory();
    (opened, move |selection: &DeviceSelection| {
        flag.store(true, Ordering::SeqCst);
        inner(selection)
    })
}

fn completed(outcome: RunOutcome) -> kernel_runner_core::RunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        other => panic!("expected a completed run, got {other:?}"),
    }
}

// ── inout semantics ─────────────────────────────────────────────────────────

#[test]
fn every_run_starts_from_the_pristine_inout_copy() {
    let registry = registry();
    let backend =
        SimulatedBackend::new(Ecosystem::Cuda).with_kernel("accumulate", accumulate_kernel);
    let mut io = accumulate_io();
    let report = completed(
        Orchestrator::new(&registry, &mut io)
            .with_backend_factory(backend.into_factory())
            .run(accumulate_options(3))
            .unwrap(),
    );

    assert_eq!(report.runs, 3);
    assert_eq!(io.file("out/acc.out"), Some(&[3u8; 8][..]));
    assert_eq!(io.file("in/acc"), Some(&[1u8; 8][..]));
}

#[test]
fn inout_buffers_get_two_allocations() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = accumulate_io();
    Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(accumulate_options(1))
        .unwrap();

    let allocations = log.allocations();
    assert_eq!(allocations.iter().filter(|(name, _)| name == "acc").count(), 2);
    assert_eq!(allocations.iter().filter(|(name, _)| name == "delta").count(), 1);
    assert_eq!(allocations.iter().filter(|(name, _)| name == "snapshot").count(), 1);
}

#[test]
fn reset_is_idempotent() {
    let registry = registry();
    let mut backend = SimulatedBackend::new(Ecosystem::Cuda);
    backend
        .build(&BuildRequest {
            source: "",
            source_path: std::path::Path::new("k.cu"),
            entry_point: "accumulate",
            flags: Default::default(),
            include_paths: &[],
            preinclude_files: &[],
            definitions: &Default::default(),
        })
        .unwrap();
    let mut ctx = ExecutionContext::new(
        accumulate_options(1),
        Box::new(backend),
        registry.produce("accumulate").unwrap(),
    );
    ctx.buffers_mut().host.inputs.insert("acc".into(), vec![5, 6, 7, 8]);
    ctx.buffers_mut().host.inputs.insert("delta".into(), vec![0; 4]);
    buffers::create_host_output_buffers(&mut ctx).unwrap();
    buffers::create_device_buffers(&mut ctx).unwrap();
    buffers::copy_input_buffers_to_device(&mut ctx).unwrap();

    buffers::reset_inout_working_copies(&mut ctx).unwrap();
    buffers::reset_inout_working_copies(&mut ctx).unwrap();

    let working = ctx.buffers().device.outputs["acc"];
    let mut bytes = [0u8; 4];
    ctx.backend_mut().copy_to_host(working, &mut bytes).unwrap();
    assert_eq!(bytes, [5, 6, 7, 8]);
}

// ── per-run ordering ────────────────────────────────────────────────────────

#[test]
fn each_launch_is_preceded_by_zero_fill_and_reset() {
    let registry = registry();
    let backend =
        SimulatedBackend::new(Ecosystem::Cuda).with_kernel("accumulate", accumulate_kernel);
    let log = backend.log();
    let mut io = accumulate_io();
    let mut opts = accumulate_options(4);
    opts.zero_output_buffers = true;
    Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap();

    let ops = log.operations();
    let launches: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| matches!(op, Operation::Launch { .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(launches.len(), 4);

    let mut previous = 0;
    for &at in &launches {
        let window = &ops[previous..at];
        let zero = window.iter().position(|op| matches!(op, Operation::ZeroFill { .. }));
        let reset = window.iter().position(|op| matches!(op, Operation::CopyOnDevice { .. }));
        assert!(zero.is_some(), "no zero-fill before launch at {at}");
        assert!(reset.is_some(), "no inout reset before launch at {at}");
        assert!(zero < reset);
        assert!(matches!(ops[at + 1], Operation::Synchronize));
        previous = at + 1;
    }
}

#[test]
fn zero_fill_touches_only_output_only_buffers() {
    let registry = registry();
    let backend =
        SimulatedBackend::new(Ecosystem::Cuda).with_kernel("accumulate", accumulate_kernel);
    let log = backend.log();
    let mut io = accumulate_io();
    let mut opts = accumulate_options(2);
    opts.zero_output_buffers = true;
    Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap();

    let snapshot_handle = log
        .operations()
        .into_iter()
        .find_map(|op| match op {
            Operation::Allocate { name, handle, .. } if name == "snapshot" => Some(handle),
            _ => None,
        })
        .unwrap();
    let zeroed: Vec<_> = log
        .operations()
        .into_iter()
        .filter_map(|op| match op {
            Operation::ZeroFill { handle } => Some(handle),
            _ => None,
        })
        .collect();
    assert_eq!(zeroed.len(), 2);
    assert!(zeroed.iter().all(|h| *h == snapshot_handle));

    let mut expected = vec![3u8; 4];
    expected.extend([0u8; 4]);
    assert_eq!(io.file("out/snapshot.out"), Some(expected.as_slice()));
}

#[test]
fn timings_are_collected_per_run() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let mut io = accumulate_io();
    let mut opts = accumulate_options(3);
    opts.time_with_events = true;
    let report = completed(
        Orchestrator::new(&registry, &mut io)
            .with_backend_factory(backend.into_factory())
            .run(opts)
            .unwrap(),
    );
    assert_eq!(report.timings, vec![kernel_runner_test_support::SIMULATED_RUN_TIME; 3]);
}

// ── sizing and deduction ────────────────────────────────────────────────────

#[test]
fn buffer_size_comes_from_the_size_calculator() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = padded_io();
    let report = completed(
        Orchestrator::new(&registry, &mut io)
            .with_backend_factory(backend.into_factory())
            .run(padded_options())
            .unwrap(),
    );

    assert_eq!(log.allocations(), vec![("data".to_string(), 12)]);
    assert_eq!(io.file("out/data.out").map(<[u8]>::len), Some(12));
    assert_eq!(report.launch_config.block, [32, 1, 1]);
    assert_eq!(report.launch_config.grid, [1, 1, 1]);
    assert!(!report.launch_config.full_blocks);
}

#[test]
fn adapter_entry_point_name_is_built() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = padded_io();
    Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(padded_options())
        .unwrap();
    let built = log.operations().into_iter().find_map(|op| match op {
        Operation::Build { entry_point, flags } => Some((entry_point, flags)),
        _ => None,
    });
    assert_eq!(built, Some(("padded_fill".to_string(), vec!["-DFILL_VALUE=7".to_string()])));
}

#[test]
fn undeducible_launch_config_is_fatal() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = accumulate_io();
    let err = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(options("accumulate"))
        .unwrap_err();
    assert!(matches!(err, RunnerError::UndeducibleLaunchConfig { .. }));
    assert_eq!(log.launches(), 0);
    assert!(log.was_released());
}

#[test]
fn explicit_sizes_accompany_opencl_arguments() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::OpenCl);
    let log = backend.log();
    let mut io = accumulate_io();
    let mut opts = accumulate_options(1);
    opts.ecosystem = Ecosystem::OpenCl;
    Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap();
    let sizes = log.operations().into_iter().find_map(|op| match op {
        Operation::Launch { sizes, arguments, .. } => Some((arguments, sizes)),
        _ => None,
    });
    let (arguments, sizes) = sizes.unwrap();
    assert_eq!(arguments, vec!["acc", "delta", "snapshot"]);
    assert_eq!(sizes.map(|s| s.len()), Some(3));
}

// ── failure paths ───────────────────────────────────────────────────────────

#[test]
fn unknown_kernel_fails_before_any_device_work() {
    let registry = registry();
    let (opened, factory) = tracking_factory(SimulatedBackend::new(Ecosystem::Cuda));
    let mut io = accumulate_io();
    let err = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(factory)
        .run(options("no_such_kernel"))
        .unwrap_err();
    assert!(matches!(err, RunnerError::UnknownKernel { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!opened.load(Ordering::SeqCst));
}

#[test]
fn missing_definition_is_caught_before_compilation() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = padded_io();
    let mut opts = padded_options();
    opts.preprocessor_definitions.clear();
    let err = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap_err();
    assert!(matches!(err, RunnerError::MissingDefinition { ref name } if name == "FILL_VALUE"));
    assert!(!log.was_built());
    assert!(log.was_released());
}

#[test]
fn missing_scalar_is_detected_after_compilation() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = padded_io();
    let mut opts = padded_options();
    opts.scalar_arguments.clear();
    let err = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(log.was_built());
    assert!(log.allocations().is_empty());
}

#[test]
fn build_failure_still_releases_the_backend() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda).with_build_failure("k.cu(1): error");
    let log = backend.log();
    let mut io = accumulate_io();
    let err = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(accumulate_options(1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compilation);
    assert!(log.was_released());
}

#[test]
fn existing_output_is_not_overwritten_without_permission() {
    let registry = registry();
    let (opened, factory) = tracking_factory(SimulatedBackend::new(Ecosystem::Cuda));
    let mut io = accumulate_io().with_file("out/snapshot.out", vec![9u8; 8]);
    let err = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(factory)
        .run(accumulate_options(1))
        .unwrap_err();
    assert!(matches!(err, RunnerError::OverwriteRefused { .. }));
    assert!(!opened.load(Ordering::SeqCst));
    assert_eq!(io.file("out/snapshot.out"), Some(&[9u8; 8][..]));
}

#[test]
fn overwrite_allowed_replaces_existing_output() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let mut io = accumulate_io().with_file("out/snapshot.out", vec![9u8; 8]);
    let mut opts = accumulate_options(1);
    opts.overwrite_allowed = true;
    Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap();
    assert_eq!(io.file("out/snapshot.out"), Some(&[0u8; 8][..]));
}

// ── compile-only ────────────────────────────────────────────────────────────

#[test]
fn compile_only_needs_no_inputs_and_writes_ir() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda);
    let log = backend.log();
    let mut io = MemoryIo::new().with_file("kernels/k.cu", "__global__ void accumulate() {}");
    let mut opts = accumulate_options(1);
    opts.compile_only = true;
    opts.write_ir = true;
    let outcome = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap();

    assert_eq!(outcome, RunOutcome::CompiledOnly { ir_written: Some(PathBuf::from("accumulate.ptx")) });
    assert!(io.file("accumulate.ptx").is_some());
    assert!(log.allocations().is_empty());
    assert_eq!(log.launches(), 0);
    assert!(log.was_released());
}

#[test]
fn missing_ir_is_not_an_error() {
    let registry = registry();
    let backend = SimulatedBackend::new(Ecosystem::Cuda).without_ir();
    let mut io = MemoryIo::new().with_file("kernels/k.cu", "__global__ void accumulate() {}");
    let mut opts = accumulate_options(1);
    opts.compile_only = true;
    opts.write_ir = true;
    opts.ir_output_file = Some(PathBuf::from("custom.ptx"));
    let outcome = Orchestrator::new(&registry, &mut io)
        .with_backend_factory(backend.into_factory())
        .run(opts)
        .unwrap();
    assert_eq!(outcome, RunOutcome::CompiledOnly { ir_written: None });
    assert!(io.file("custom.ptx").is_none());
}

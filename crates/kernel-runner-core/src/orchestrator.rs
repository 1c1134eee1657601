//! The fixed run sequence.
//!
//! Everything that can be checked without a device (options, adapter lookup,
//! output destinations) is checked before a backend is opened. Once a backend
//! exists it is released on every exit path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kernel_runner_backends::{
    open_backend, ArgumentList, Backend, BuildRequest, CompilationFlags, DeviceSelection,
};
use kernel_runner_common::{
    is_valid_identifier, options::prepend_base_dir, Ecosystem, PreprocessorDefinitions,
    ResolvedLaunchConfig, Result, RunOptions, RunnerError,
};
use tracing::{debug, info, trace, warn};

use crate::adapter::KernelAdapter;
use crate::adapter::ParameterDirection::{In, InOut, Out};
use crate::buffers;
use crate::context::{BufferMaps, ExecutionContext};
use crate::io::RunnerIo;
use crate::registry::AdapterRegistry;

/// Opens a backend for a device selection.
pub type BackendFactory = Box<dyn Fn(&DeviceSelection) -> Result<Box<dyn Backend>>>;

/// Extension of output buffer files named after their buffer.
pub const OUTPUT_FILE_EXTENSION: &str = "out";

/// The CUDA toolkit's header directory: `$CUDA_PATH/include`, or the usual
/// install location.
pub fn default_cuda_include_dir() -> PathBuf {
    std::env::var_os("CUDA_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/usr/local/cuda"))
        .join("include")
}

/// How a successful run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Built only; nothing was read, allocated or launched.
    CompiledOnly { ir_written: Option<PathBuf> },
    Completed(RunReport),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub runs: u32,
    /// Device-measured time per run, when timing was requested.
    pub timings: Vec<Duration>,
    pub launch_config: ResolvedLaunchConfig,
    pub outputs_written: Vec<PathBuf>,
    pub ir_written: Option<PathBuf>,
}

/// Decisions made before any device resource is touched.
#[derive(Debug, Clone, Default)]
struct RunPlan {
    filenames: BufferMaps<PathBuf>,
    ir_path: Option<PathBuf>,
}

pub struct Orchestrator<'a> {
    registry: &'a AdapterRegistry,
    io: &'a mut dyn RunnerIo,
    open_backend: BackendFactory,
    cuda_include_dir: PathBuf,
}

impl<'a> Orchestrator<'a> {
    pub fn new(registry: &'a AdapterRegistry, io: &'a mut dyn RunnerIo) -> Self {
        Self {
            registry,
            io,
            open_backend: Box::new(open_backend),
            cuda_include_dir: default_cuda_include_dir(),
        }
    }

    /// Replace the function used to open a backend.
    pub fn with_backend_factory(
        mut self,
        factory: impl Fn(&DeviceSelection) -> Result<Box<dyn Backend>> + 'static,
    ) -> Self {
        self.open_backend = Box::new(factory);
        self
    }

    pub fn with_cuda_include_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cuda_include_dir = dir.into();
        self
    }

    /// Run the whole sequence for one kernel.
    pub fn run(&mut self, mut options: RunOptions) -> Result<RunOutcome> {
        options.validate()?;
        let adapter = self.registry.produce(&options.kernel.key)?;
        finalize_function_name(&mut options, &*adapter)?;
        let plan = self.plan(&options, &*adapter)?;

        let selection = DeviceSelection {
            ecosystem: options.ecosystem,
            platform_id: options.platform_id,
            device_id: options.device_id,
            need_ir: options.write_ir,
        };
        let backend = (self.open_backend)(&selection)?;
        if backend.ecosystem() != options.ecosystem {
            return Err(RunnerError::environment(format!(
                "requested the {} ecosystem but the backend drives {}",
                options.ecosystem,
                backend.ecosystem()
            )));
        }

        let mut ctx = ExecutionContext::new(options, backend, adapter);
        ctx.buffers.filenames = plan.filenames.clone();
        let outcome = self.drive(&mut ctx, &plan);
        release(&mut ctx);
        outcome
    }

    fn plan(&self, options: &RunOptions, adapter: &dyn KernelAdapter) -> Result<RunPlan> {
        let mut plan = RunPlan::default();
        let base = &options.buffer_base_paths;

        for name in adapter.buffer_names(&[In, InOut]) {
            let filename = match options.buffer_filenames.get(name) {
                Some(path) => path.clone(),
                None => {
                    debug!("filename for input buffer {name} not specified; defaulting to its name");
                    PathBuf::from(name)
                }
            };
            let path = prepend_base_dir(&base.input, &filename);
            trace!("filename for input buffer {name}: {}", path.display());
            plan.filenames.inputs.insert(name.to_string(), path);
        }

        let writes_outputs = options.write_output_buffers_to_files && !options.compile_only;
        if writes_outputs {
            for name in adapter.buffer_names(&[Out, InOut]) {
                let explicit = options.buffer_filenames.get(name).filter(|_| {
                    adapter.find_parameter(name).map(|p| p.direction) == Some(Out)
                });
                let filename = match explicit {
                    Some(path) => path.clone(),
                    None => PathBuf::from(format!("{name}.{OUTPUT_FILE_EXTENSION}")),
                };
                let path = prepend_base_dir(&base.output, &filename);
                self.check_overwrite(&format!("output buffer {name}"), &path, options)?;
                trace!("filename for output buffer {name}: {}", path.display());
                plan.filenames.outputs.insert(name.to_string(), path);
            }
        }

        if options.write_ir {
            let path = options.ir_output_file.clone().unwrap_or_else(|| {
                PathBuf::from(format!(
                    "{}.{}",
                    options.function_name(),
                    options.ecosystem.ir_extension()
                ))
            });
            self.check_overwrite("the compiled IR", &path, options)?;
            plan.ir_path = Some(path);
        }
        Ok(plan)
    }

    fn check_overwrite(&self, what: &str, path: &Path, options: &RunOptions) -> Result<()> {
        if !self.io.exists(path) {
            return Ok(());
        }
        if !options.overwrite_allowed {
            return Err(RunnerError::OverwriteRefused { path: path.display().to_string() });
        }
        info!("{what} will overwrite {}", path.display());
        Ok(())
    }

    fn drive(&mut self, ctx: &mut ExecutionContext, plan: &RunPlan) -> Result<RunOutcome> {
        debug!(kernel = ctx.adapter.key(), device = %ctx.backend.device_description(), "execution context ready");

        self.finalize_build_inputs(ctx)?;
        self.build(ctx)?;
        let ir_written = self.write_ir(ctx, plan)?;

        if ctx.options.compile_only {
            info!("compilation-only mode; not reading buffers or running the kernel");
            return Ok(RunOutcome::CompiledOnly { ir_written });
        }

        buffers::read_input_buffers(ctx, &mut *self.io)?;
        verify_inputs(ctx)?;

        buffers::create_host_output_buffers(ctx)?;
        buffers::create_device_buffers(ctx)?;

        let generated = ctx.adapter.generate_additional_scalar_arguments(ctx)?;
        for (name, value) in generated {
            trace!("generated scalar argument {name} = {value:?}");
            ctx.scalar_arguments.typed.insert(name, value);
        }

        buffers::copy_input_buffers_to_device(ctx)?;

        let mut arguments = ArgumentList::new();
        ctx.adapter.marshal_kernel_arguments(ctx, &mut arguments)?;
        ctx.marshalled_arguments = Some(ctx.backend.argument_convention().finalize(arguments));
        let launch_config = resolve_launch_config(ctx)?;
        ctx.launch_config = Some(launch_config);

        for run_index in 0..ctx.options.num_runs {
            perform_single_run(ctx, run_index, &launch_config)?;
        }

        let outputs_written = if ctx.options.write_output_buffers_to_files {
            self.write_outputs(ctx)?
        } else {
            Vec::new()
        };

        Ok(RunOutcome::Completed(RunReport {
            runs: ctx.options.num_runs,
            timings: ctx.run_timings.clone(),
            launch_config,
            outputs_written,
            ir_written,
        }))
    }

    /// Parse scalars, resolve include paths and finalize definitions.
    fn finalize_build_inputs(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        for (name, raw) in &ctx.options.scalar_arguments {
            if ctx.adapter.find_parameter(name).filter(|p| !p.is_buffer()).is_none() {
                warn!("ignoring value for `{name}`, which is not a scalar parameter of this kernel");
                continue;
            }
            let value = ctx.adapter.parse_scalar_argument(name, raw)?;
            trace!("parsed scalar argument {name} = {value:?}");
            ctx.scalar_arguments.raw.insert(name.clone(), raw.clone());
            ctx.scalar_arguments.typed.insert(name.clone(), value);
        }

        ctx.include_paths = self.include_paths(&ctx.options);

        ctx.preprocessor_definitions = PreprocessorDefinitions::finalize(
            &ctx.options.preprocessor_definitions,
            &ctx.options.preprocessor_value_definitions,
        );
        for name in ctx.adapter.required_definition_names() {
            if !ctx.preprocessor_definitions.defines(name) {
                return Err(RunnerError::MissingDefinition { name: name.to_string() });
            }
        }
        Ok(())
    }

    fn include_paths(&self, options: &RunOptions) -> Vec<PathBuf> {
        let source_dir = options
            .kernel
            .source_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut paths = vec![source_dir];
        paths.extend(options.include_dir_paths.iter().cloned());
        if options.ecosystem == Ecosystem::Cuda {
            if self.io.is_dir(&self.cuda_include_dir) {
                paths.push(self.cuda_include_dir.clone());
            } else {
                warn!(
                    "CUDA include directory {} not found; kernels including toolkit headers will not build",
                    self.cuda_include_dir.display()
                );
            }
        }
        for path in &paths {
            trace!("include path: {}", path.display());
        }
        paths
    }

    fn build(&mut self, ctx: &mut ExecutionContext) -> Result<()> {
        let source_path = ctx.options.kernel.source_file.clone();
        let source = self.io.read_kernel_source(&source_path)?;
        let flags = CompilationFlags {
            debug: ctx.options.compile_in_debug_mode,
            line_info: ctx.options.generate_line_info,
            language_standard: ctx.options.language_standard,
        };
        let request = BuildRequest {
            source: &source,
            source_path: &source_path,
            entry_point: ctx.options.function_name(),
            flags,
            include_paths: &ctx.include_paths,
            preinclude_files: &ctx.options.preinclude_files,
            definitions: &ctx.preprocessor_definitions,
        };
        debug!("building kernel {} from {}", request.entry_point, source_path.display());
        let output = ctx.backend.build(&request)?;
        info!("kernel {} built successfully", ctx.options.function_name());
        ctx.compiled_ir = output.ir;
        Ok(())
    }

    fn write_ir(&mut self, ctx: &ExecutionContext, plan: &RunPlan) -> Result<Option<PathBuf>> {
        let Some(path) = &plan.ir_path else {
            return Ok(None);
        };
        match &ctx.compiled_ir {
            Some(ir) => {
                self.io.write_ir(path, ir)?;
                info!("wrote compiled IR to {}", path.display());
                Ok(Some(path.clone()))
            }
            None => {
                warn!("the build produced no IR; not writing {}", path.display());
                Ok(None)
            }
        }
    }

    fn write_outputs(&mut self, ctx: &mut ExecutionContext) -> Result<Vec<PathBuf>> {
        buffers::copy_outputs_from_device(ctx)?;
        let mut written = Vec::new();
        for (name, data) in &ctx.buffers.host.outputs {
            let path = ctx
                .buffers
                .filenames
                .outputs
                .get(name)
                .ok_or_else(|| RunnerError::MissingBuffer { name: name.clone() })?;
            self.io.write_buffer(name, path, data)?;
            debug!("wrote output buffer {name} ({} bytes) to {}", data.len(), path.display());
            written.push(path.clone());
        }
        Ok(written)
    }
}

fn finalize_function_name(options: &mut RunOptions, adapter: &dyn KernelAdapter) -> Result<()> {
    if options.kernel.function_name.is_none() {
        let name = adapter.entry_point_name();
        if !is_valid_identifier(name) {
            return Err(RunnerError::configuration(format!(
                "kernel `{}` has entry point `{name}`, which is not a valid identifier",
                adapter.key()
            )));
        }
        debug!("using the adapter's entry point name: {name}");
        options.kernel.function_name = Some(name.to_string());
    }
    Ok(())
}

fn verify_inputs(ctx: &ExecutionContext) -> Result<()> {
    for name in ctx.adapter.buffer_names(&[In, InOut]) {
        if !ctx.buffers.host.inputs.contains_key(name) {
            return Err(RunnerError::MissingBuffer { name: name.to_string() });
        }
    }
    for name in ctx.adapter.required_scalar_names() {
        if !ctx.scalar_arguments.typed.contains_key(name) {
            return Err(RunnerError::MissingScalar { name: name.to_string() });
        }
    }
    for name in ctx.adapter.required_definition_names() {
        if !ctx.preprocessor_definitions.defines(name) {
            return Err(RunnerError::MissingDefinition { name: name.to_string() });
        }
    }
    if !ctx.adapter.input_sizes_are_valid(ctx) {
        return Err(RunnerError::validation(format!(
            "input buffer sizes are invalid for kernel {}",
            ctx.adapter.key()
        )));
    }
    if !ctx.adapter.extra_validity_checks(ctx) {
        return Err(RunnerError::validation(format!(
            "kernel {} rejected its arguments",
            ctx.adapter.key()
        )));
    }
    Ok(())
}

fn resolve_launch_config(ctx: &ExecutionContext) -> Result<ResolvedLaunchConfig> {
    let forced = ctx.options.forced_launch_config;
    let components = if forced.is_sufficient() {
        forced
    } else {
        ctx.adapter.deduce_launch_config(ctx)?
    };
    let resolved = components.deduce_missing(ctx.adapter.key())?;
    info!(full_blocks = resolved.full_blocks, "launch configuration: {resolved}");
    if !resolved.full_blocks {
        debug!("overall dimensions are not a multiple of the block dimensions; the last blocks are partial");
    }
    Ok(resolved)
}

fn perform_single_run(
    ctx: &mut ExecutionContext,
    run_index: u32,
    launch_config: &ResolvedLaunchConfig,
) -> Result<()> {
    if ctx.options.zero_output_buffers {
        buffers::zero_output_buffers(ctx)?;
    }
    buffers::reset_inout_working_copies(ctx)?;

    let arguments = ctx.marshalled_arguments.as_ref().ok_or_else(|| {
        RunnerError::resource("kernel launch", "arguments have not been marshalled")
    })?;
    debug!("launching run {} of {}", run_index + 1, ctx.options.num_runs);
    let elapsed = ctx.backend.launch(arguments, launch_config, ctx.options.time_with_events)?;
    ctx.backend.synchronize()?;
    if let Some(elapsed) = elapsed {
        info!("run {}: kernel execution took {:.3} ms", run_index + 1, elapsed.as_secs_f64() * 1e3);
        ctx.run_timings.push(elapsed);
    }
    Ok(())
}

fn release(ctx: &mut ExecutionContext) {
    debug!("releasing backend resources");
    if let Err(e) = ctx.backend.release() {
        warn!("failed to release backend resources: {e}");
    }
}

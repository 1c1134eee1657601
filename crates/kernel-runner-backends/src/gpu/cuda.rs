//! CUDA backend using cudarc 0.17 (driver API + NVRTC).
//!
//! A single context per device; every operation goes through that context's
//! default stream.

use std::ffi::c_char;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cudarc::driver::sys::CUevent_flags;
use cudarc::driver::{
    CudaContext, CudaFunction, CudaModule, CudaSlice, CudaStream, LaunchArgs, LaunchConfig,
    PushKernelArg,
};
use cudarc::nvrtc::{result as nvrtc, Ptx};
use kernel_runner_common::{Ecosystem, ResolvedLaunchConfig, Result, RunnerError, ScalarValue};
use tracing::{debug, info, warn};

use crate::arguments::{ArgumentConvention, KernelArgument, MarshalledArguments};
use crate::backend::{
    report_build_log, src_and_dst, Backend, BufferHandle, BuildOutput, BuildRequest,
};

/// Live driver handles; dropped as a unit on release.
struct CudaState {
    ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    module: Option<Arc<CudaModule>>,
    function: Option<CudaFunction>,
    buffers: Vec<CudaSlice<u8>>,
}

impl CudaState {
    fn buffer(&self, handle: BufferHandle) -> Result<&CudaSlice<u8>> {
        self.buffers.get(handle.index()).ok_or_else(|| unknown_handle(handle))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut CudaSlice<u8>> {
        self.buffers.get_mut(handle.index()).ok_or_else(|| unknown_handle(handle))
    }
}

fn unknown_handle(handle: BufferHandle) -> RunnerError {
    RunnerError::resource("CUDA buffer lookup", format!("no allocation with handle {}", handle.index()))
}

fn released() -> RunnerError {
    RunnerError::resource("CUDA operation", "backend resources were already released")
}

/// CUDA implementation of [`Backend`].
pub struct CudaBackend {
    device_id: usize,
    device_name: String,
    state: Option<CudaState>,
}

impl std::fmt::Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaBackend")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("released", &self.state.is_none())
            .finish()
    }
}

impl CudaBackend {
    /// Validate `device_id` and create its context.
    pub fn open(device_id: usize) -> Result<Self> {
        let count = CudaContext::device_count().map_err(|e| {
            RunnerError::environment(format!("failed to query CUDA devices: {e:?}"))
        })?;
        if count <= 0 {
            return Err(RunnerError::environment("no CUDA devices detected on this system"));
        }
        if device_id >= count as usize {
            return Err(RunnerError::environment(format!(
                "please specify a valid CUDA device index (in the range 0..{})",
                count - 1
            )));
        }

        info!("initializing CUDA context on device {device_id}");
        let ctx = CudaContext::new(device_id).map_err(|e| {
            RunnerError::environment(format!(
                "failed to create CUDA context for device {device_id}: {e:?}"
            ))
        })?;
        let device_name = ctx.name().unwrap_or_else(|_| format!("CUDA device {device_id}"));
        let stream = ctx.default_stream();

        Ok(Self {
            device_id,
            device_name,
            state: Some(CudaState { ctx, stream, module: None, function: None, buffers: Vec::new() }),
        })
    }

    fn state(&self) -> Result<&CudaState> {
        self.state.as_ref().ok_or_else(released)
    }

    fn state_mut(&mut self) -> Result<&mut CudaState> {
        self.state.as_mut().ok_or_else(released)
    }
}

/// NVRTC command-line options for `request`.
fn nvrtc_options(request: &BuildRequest<'_>) -> Vec<String> {
    let mut options = Vec::new();
    if request.flags.debug {
        options.push("--device-debug".to_string());
    }
    if request.flags.line_info {
        options.push("--generate-line-info".to_string());
    }
    if let Some(standard) = request.flags.language_standard {
        options.push(standard.compiler_flag());
    }
    for path in request.include_paths {
        options.push(format!("--include-path={}", path_string(path)));
    }
    for file in request.preinclude_files {
        options.push(format!("--pre-include={}", path_string(file)));
    }
    options.extend(request.definitions.compiler_flags());
    options
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}

/// NUL-terminated NVRTC text as a Rust string.
fn nvrtc_text(raw: &[c_char]) -> String {
    let bytes: Vec<u8> = raw.iter().map(|&c| c as u8).take_while(|&b| b != 0).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Compile `source` to PTX. The program log comes back whether or not the
/// compilation succeeded.
fn compile_to_ptx(
    source: &str,
    options: &[String],
) -> (std::result::Result<String, String>, String) {
    let program = match nvrtc::create_program(source) {
        Ok(program) => program,
        Err(e) => return (Err(format!("failed to create the NVRTC program: {e}")), String::new()),
    };
    // SAFETY: `program` was created above and is destroyed only at the end of this function.
    let compiled = unsafe { nvrtc::compile_program(program, options) };
    let log = unsafe { nvrtc::get_program_log(program) }
        .map(|raw| nvrtc_text(&raw))
        .unwrap_or_default();
    let outcome = match compiled {
        Ok(()) => unsafe { nvrtc::get_ptx(program) }
            .map(|raw| nvrtc_text(&raw))
            .map_err(|e| format!("failed to retrieve the PTX: {e}")),
        Err(e) => Err(format!("NVRTC compilation failed: {e}")),
    };
    if let Err(e) = unsafe { nvrtc::destroy_program(program) } {
        warn!("failed to destroy the NVRTC program: {e}");
    }
    (outcome, log)
}

/// Report the log and turn a compilation outcome into the IR or an error.
fn finish_compilation(
    entry_point: &str,
    outcome: std::result::Result<String, String>,
    log: &str,
) -> Result<String> {
    report_build_log(entry_point, log, outcome.is_ok());
    outcome.map_err(|reason| RunnerError::Compilation {
        kernel: entry_point.to_string(),
        reason: format!("{reason}; see the compilation log"),
    })
}

fn push_scalar<'a>(builder: &mut LaunchArgs<'a>, value: &'a ScalarValue) {
    match value {
        ScalarValue::I8(v) => builder.arg(v),
        ScalarValue::U8(v) => builder.arg(v),
        ScalarValue::I16(v) => builder.arg(v),
        ScalarValue::U16(v) => builder.arg(v),
        ScalarValue::I32(v) => builder.arg(v),
        ScalarValue::U32(v) => builder.arg(v),
        ScalarValue::I64(v) => builder.arg(v),
        ScalarValue::U64(v) => builder.arg(v),
        ScalarValue::F32(v) => builder.arg(v),
        ScalarValue::F64(v) => builder.arg(v),
    };
}

impl Backend for CudaBackend {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Cuda
    }

    fn device_description(&self) -> String {
        format!("CUDA device {} ({})", self.device_id, self.device_name)
    }

    fn argument_convention(&self) -> ArgumentConvention {
        ArgumentConvention::SentinelTerminated
    }

    fn build(&mut self, request: &BuildRequest<'_>) -> Result<BuildOutput> {
        let entry_point = request.entry_point;
        debug!(kernel = %entry_point, source = %request.source_path.display(), "compiling with NVRTC");
        let opts = nvrtc_options(request);

        let (outcome, log) = compile_to_ptx(request.source, &opts);
        let ir = finish_compilation(entry_point, outcome, &log)?;
        debug!(kernel = %entry_point, ptx_bytes = ir.len(), "NVRTC compilation succeeded");

        let state = self.state_mut()?;
        let module = state
            .ctx
            .load_module(Ptx::from_src(ir.clone()))
            .map_err(|e| RunnerError::Compilation {
                kernel: entry_point.to_string(),
                reason: format!("failed to load CUDA module: {e:?}"),
            })?;
        let function = module.load_function(entry_point).map_err(|e| RunnerError::Compilation {
            kernel: entry_point.to_string(),
            reason: format!("entry point not found in module: {e:?}"),
        })?;
        state.module = Some(module);
        state.function = Some(function);

        Ok(BuildOutput { ir: Some(ir), log })
    }

    fn allocate(&mut self, name: &str, size: usize) -> Result<BufferHandle> {
        let state = self.state_mut()?;
        let slice = state.stream.alloc_zeros::<u8>(size).map_err(|e| {
            RunnerError::resource(format!("allocating {size} bytes for buffer `{name}`"), format!("{e:?}"))
        })?;
        state.buffers.push(slice);
        Ok(BufferHandle::new(state.buffers.len() - 1))
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.state()?.buffer(handle)?.len())
    }

    fn copy_to_device(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let state = self.state_mut()?;
        let stream = Arc::clone(&state.stream);
        let dst = state.buffer_mut(handle)?;
        stream
            .memcpy_htod(data, dst)
            .map_err(|e| RunnerError::resource("host-to-device copy", format!("{e:?}")))
    }

    fn copy_on_device(&mut self, dst: BufferHandle, src: BufferHandle) -> Result<()> {
        let state = self.state_mut()?;
        let (src_slice, dst_slice) = src_and_dst(&mut state.buffers, src.index(), dst.index())
            .ok_or_else(|| {
                RunnerError::resource(
                    "device-to-device copy",
                    format!("invalid handle pair {} -> {}", src.index(), dst.index()),
                )
            })?;
        state
            .stream
            .memcpy_dtod(src_slice, dst_slice)
            .map_err(|e| RunnerError::resource("device-to-device copy", format!("{e:?}")))
    }

    fn copy_to_host(&mut self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let state = self.state()?;
        state
            .stream
            .memcpy_dtoh(state.buffer(handle)?, data)
            .map_err(|e| RunnerError::resource("device-to-host copy", format!("{e:?}")))
    }

    fn zero_fill(&mut self, handle: BufferHandle) -> Result<()> {
        let state = self.state_mut()?;
        let stream = Arc::clone(&state.stream);
        let slice = state.buffer_mut(handle)?;
        stream
            .memset_zeros(slice)
            .map_err(|e| RunnerError::resource("zero-filling a device buffer", format!("{e:?}")))
    }

    fn launch(
        &mut self,
        arguments: &MarshalledArguments,
        config: &ResolvedLaunchConfig,
        timed: bool,
    ) -> Result<Option<Duration>> {
        arguments.require_convention(ArgumentConvention::SentinelTerminated)?;
        let state = self.state()?;
        let function = state.function.as_ref().ok_or_else(|| {
            RunnerError::resource("kernel launch", "no kernel has been built")
        })?;

        let mut builder = state.stream.launch_builder(function);
        for argument in arguments.arguments() {
            match argument {
                KernelArgument::Buffer { handle, .. } => {
                    builder.arg(state.buffer(*handle)?);
                }
                KernelArgument::Scalar { value, .. } => push_scalar(&mut builder, value),
            }
        }

        let cfg = LaunchConfig {
            grid_dim: (config.grid[0], config.grid[1], config.grid[2]),
            block_dim: (config.block[0], config.block[1], config.block[2]),
            shared_mem_bytes: config.dynamic_shared_memory_size,
        };

        let record = |what: &str| {
            state
                .stream
                .record_event(Some(CUevent_flags::CU_EVENT_DEFAULT))
                .map_err(|e| RunnerError::resource(format!("recording {what} event"), format!("{e:?}")))
        };
        let start = if timed { Some(record("start")?) } else { None };

        // SAFETY: the argument list was built from the adapter's schema, which
        // mirrors the compiled entry point's parameter list.
        unsafe { builder.launch(cfg) }
            .map_err(|e| RunnerError::resource("kernel launch", format!("{e:?}")))?;

        match start {
            Some(start) => {
                let end = record("end")?;
                end.synchronize()
                    .map_err(|e| RunnerError::resource("waiting for kernel completion", format!("{e:?}")))?;
                let ms = start
                    .elapsed_ms(&end)
                    .map_err(|e| RunnerError::resource("reading event timer", format!("{e:?}")))?;
                Ok(Some(Duration::from_secs_f64(f64::from(ms) / 1000.0)))
            }
            None => Ok(None),
        }
    }

    fn synchronize(&mut self) -> Result<()> {
        self.state()?
            .stream
            .synchronize()
            .map_err(|e| RunnerError::resource("CUDA stream synchronization", format!("{e:?}")))
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut state) = self.state.take() else {
            warn!("CUDA resources already released");
            return Ok(());
        };
        let buffers = state.buffers.len();
        state.buffers.clear();
        state.function = None;
        if state.module.take().is_some() {
            debug!("unloaded CUDA module");
        }
        drop(state);
        debug!(buffers, device = self.device_id, "destroyed CUDA context");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nvrtc_text_stops_at_the_terminator() {
        let raw: Vec<c_char> = b"warning: x\0garbage".iter().map(|&b| b as c_char).collect();
        assert_eq!(nvrtc_text(&raw), "warning: x");
    }

    #[test]
    fn successful_compilation_keeps_its_log() {
        let log = "kernel.cu(3): warning #177-D: variable \"t\" was declared but never referenced";
        let ir = finish_compilation("k", Ok(".version 8.0".to_string()), log).unwrap();
        assert_eq!(ir, ".version 8.0");
        assert_eq!(crate::backend::build_log_level(log, true), Some(tracing::Level::DEBUG));
    }

    #[test]
    fn failed_compilation_is_a_compilation_error() {
        let err = finish_compilation("k", Err("NVRTC compilation failed".into()), "error: x")
            .unwrap_err();
        assert!(matches!(err, RunnerError::Compilation { ref kernel, .. } if kernel == "k"));
    }

    #[test]
    fn include_paths_and_definitions_become_options() {
        let definitions = kernel_runner_common::PreprocessorDefinitions::finalize(
            &["N=4".to_string()],
            &Default::default(),
        );
        let includes = [std::path::PathBuf::from("/opt/inc")];
        let request = BuildRequest {
            source: "",
            source_path: Path::new("k.cu"),
            entry_point: "k",
            flags: Default::default(),
            include_paths: &includes,
            preinclude_files: &[],
            definitions: &definitions,
        };
        let options = nvrtc_options(&request);
        assert!(options.contains(&"--include-path=/opt/inc".to_string()));
        assert!(options.contains(&"-DN=4".to_string()));
    }
}

//! OpenCL backend using `opencl3`.
//!
//! Resolves a platform, device, context and profiling-enabled queue once; every
//! allocation, copy, build, launch, fill and read reuses that chain.

use std::ptr;
use std::time::Duration;

use kernel_runner_common::{Ecosystem, ResolvedLaunchConfig, Result, RunnerError, ScalarValue};
use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_GPU};
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_READ_WRITE};
use opencl3::platform::get_platforms;
use opencl3::program::Program;
use opencl3::types::{cl_mem, cl_uint, CL_BLOCKING};
use tracing::{debug, info, warn};

use crate::arguments::{ArgumentConvention, KernelArgument, MarshalledArguments};
use crate::backend::{report_build_log, src_and_dst, Backend, BufferHandle, BuildOutput, BuildRequest};

/// Live OpenCL handles; dropped as a unit on release.
struct OpenClState {
    device: Device,
    context: Context,
    queue: CommandQueue,
    program: Option<Program>,
    kernel: Option<Kernel>,
    buffers: Vec<Buffer<u8>>,
}

// SAFETY: OpenCL handles are reference-counted by the runtime and the queue is
// only driven from the thread that owns the backend.
unsafe impl Send for OpenClState {}

impl OpenClState {
    fn buffer(&self, handle: BufferHandle) -> Result<&Buffer<u8>> {
        self.buffers.get(handle.index()).ok_or_else(|| unknown_handle(handle))
    }
}

fn unknown_handle(handle: BufferHandle) -> RunnerError {
    RunnerError::resource("OpenCL buffer lookup", format!("no allocation with handle {}", handle.index()))
}

fn released() -> RunnerError {
    RunnerError::resource("OpenCL operation", "backend resources were already released")
}

/// OpenCL implementation of [`Backend`].
pub struct OpenClBackend {
    platform_id: usize,
    device_id: usize,
    platform_name: String,
    device_name: String,
    state: Option<OpenClState>,
}

impl std::fmt::Debug for OpenClBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClBackend")
            .field("platform_id", &self.platform_id)
            .field("device_id", &self.device_id)
            .field("platform_name", &self.platform_name)
            .field("device_name", &self.device_name)
            .field("released", &self.state.is_none())
            .finish()
    }
}

impl OpenClBackend {
    /// Resolve platform and device, then create the context and queue.
    ///
    /// When `need_ir` is set the platform must emit textual IR during builds;
    /// this is checked here so no device work happens on a run that would fail
    /// to produce its IR file.
    pub fn open(platform_id: Option<usize>, device_id: usize, need_ir: bool) -> Result<Self> {
        let platform_id = platform_id.unwrap_or(0);
        let platforms = get_platforms().map_err(|e| {
            RunnerError::environment(format!("failed to get OpenCL platforms: {e}"))
        })?;
        if platforms.is_empty() {
            return Err(RunnerError::environment("no OpenCL platforms found"));
        }
        let platform = platforms.get(platform_id).ok_or_else(|| {
            RunnerError::environment(format!("no OpenCL platform exists with index {platform_id}"))
        })?;
        let platform_name = platform.name().unwrap_or_default();
        debug!("using OpenCL platform {platform_id}: {platform_name}");

        if need_ir && !crate::platform_emits_ptx(&platform_name) {
            return Err(RunnerError::configuration(format!(
                "intermediate representation requested, but OpenCL platform '{platform_name}' \
                 does not generate PTX during builds"
            )));
        }

        let device_ids = platform.get_devices(CL_DEVICE_TYPE_GPU).unwrap_or_default();
        if device_ids.is_empty() {
            return Err(RunnerError::environment(format!(
                "no OpenCL GPU devices found on platform {platform_id}"
            )));
        }
        let device_cl_id = *device_ids.get(device_id).ok_or_else(|| {
            RunnerError::environment(format!(
                "please specify a valid device index (in the range 0..{})",
                device_ids.len() - 1
            ))
        })?;
        let device = Device::new(device_cl_id);
        let device_name = device.name().unwrap_or_default();
        info!("selected OpenCL device {device_id}: {device_name}");

        let context = Context::from_device(&device).map_err(|e| {
            RunnerError::environment(format!("failed to create OpenCL context: {e}"))
        })?;
        let queue = CommandQueue::create_default_with_properties(&context, CL_QUEUE_PROFILING_ENABLE, 0)
            .map_err(|e| RunnerError::environment(format!("failed to create command queue: {e}")))?;

        Ok(Self {
            platform_id,
            device_id,
            platform_name,
            device_name,
            state: Some(OpenClState {
                device,
                context,
                queue,
                program: None,
                kernel: None,
                buffers: Vec::new(),
            }),
        })
    }

    fn state(&self) -> Result<&OpenClState> {
        self.state.as_ref().ok_or_else(released)
    }

    fn state_mut(&mut self) -> Result<&mut OpenClState> {
        self.state.as_mut().ok_or_else(released)
    }
}

/// Build options string for the OpenCL compiler.
fn build_options(request: &BuildRequest<'_>) -> String {
    let mut options = Vec::new();
    for path in request.include_paths {
        options.push(format!("-I {}", path.display()));
    }
    if request.flags.debug {
        options.push("-g".to_string());
        options.push("-cl-opt-disable".to_string());
    }
    if request.flags.line_info {
        debug!("line information is not supported for OpenCL builds; ignoring");
    }
    options.extend(request.definitions.compiler_flags());
    options.join(" ")
}

/// OpenCL C has no pre-include switch; prepend `#include` lines instead.
fn with_preincludes(request: &BuildRequest<'_>) -> String {
    let mut source = String::new();
    for file in request.preinclude_files {
        source.push_str(&format!("#include \"{}\"\n", file.display()));
    }
    source.push_str(request.source);
    source
}

/// Set one scalar argument, checking the marshalled size against the payload.
fn set_scalar_arg(kernel: &Kernel, index: cl_uint, value: &ScalarValue, size: usize) -> Result<()> {
    if size != value.byte_size() {
        return Err(RunnerError::resource(
            "setting kernel argument",
            format!("argument {index} marshalled as {size} bytes but holds a {}", value.kind()),
        ));
    }
    // SAFETY: each payload type has exactly `size` bytes, checked above.
    let result = unsafe {
        match value {
            ScalarValue::I8(v) => kernel.set_arg(index, v),
            ScalarValue::U8(v) => kernel.set_arg(index, v),
            ScalarValue::I16(v) => kernel.set_arg(index, v),
            ScalarValue::U16(v) => kernel.set_arg(index, v),
            ScalarValue::I32(v) => kernel.set_arg(index, v),
            ScalarValue::U32(v) => kernel.set_arg(index, v),
            ScalarValue::I64(v) => kernel.set_arg(index, v),
            ScalarValue::U64(v) => kernel.set_arg(index, v),
            ScalarValue::F32(v) => kernel.set_arg(index, v),
            ScalarValue::F64(v) => kernel.set_arg(index, v),
        }
    };
    result.map_err(|e| RunnerError::resource(format!("setting kernel argument {index}"), e))
}

impl Backend for OpenClBackend {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::OpenCl
    }

    fn device_description(&self) -> String {
        format!(
            "OpenCL device {} ({}) on platform {} ({})",
            self.device_id, self.device_name, self.platform_id, self.platform_name
        )
    }

    fn argument_convention(&self) -> ArgumentConvention {
        ArgumentConvention::ExplicitSizes
    }

    fn build(&mut self, request: &BuildRequest<'_>) -> Result<BuildOutput> {
        let entry_point = request.entry_point;
        let options = build_options(request);
        let source = with_preincludes(request);
        debug!(kernel = %entry_point, %options, "building OpenCL program");

        let state = self.state_mut()?;
        let mut program = Program::create_from_source(&state.context, &source).map_err(|e| {
            RunnerError::Compilation {
                kernel: entry_point.to_string(),
                reason: format!("failed to create program: {e}"),
            }
        })?;
        let outcome = program.build(state.context.devices(), &options);
        let log = program.get_build_log(state.device.id()).unwrap_or_default();
        report_build_log(entry_point, &log, outcome.is_ok());
        outcome.map_err(|e| RunnerError::Compilation {
            kernel: entry_point.to_string(),
            reason: format!("{e}; see the compilation log"),
        })?;

        let ir = match program.get_binaries() {
            Ok(binaries) => binaries
                .into_iter()
                .next()
                .map(|bytes| String::from_utf8_lossy(&bytes).trim_end_matches('\0').to_string()),
            Err(e) => {
                warn!("could not retrieve the program binary: {e}");
                None
            }
        };

        let kernel = Kernel::create(&program, entry_point).map_err(|e| RunnerError::Compilation {
            kernel: entry_point.to_string(),
            reason: format!("entry point not found in program: {e}"),
        })?;
        state.kernel = Some(kernel);
        state.program = Some(program);

        Ok(BuildOutput { ir, log })
    }

    fn allocate(&mut self, name: &str, size: usize) -> Result<BufferHandle> {
        let state = self.state_mut()?;
        // SAFETY: no host pointer is supplied.
        let buffer = unsafe {
            Buffer::<u8>::create(&state.context, CL_MEM_READ_WRITE, size.max(1), ptr::null_mut())
        }
        .map_err(|e| RunnerError::resource(format!("allocating {size} bytes for buffer `{name}`"), e))?;
        state.buffers.push(buffer);
        Ok(BufferHandle::new(state.buffers.len() - 1))
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        self.state()?
            .buffer(handle)?
            .size()
            .map_err(|e| RunnerError::resource("querying buffer size", e))
    }

    fn copy_to_device(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        let state = self.state_mut()?;
        let buffer = state.buffers.get_mut(handle.index()).ok_or_else(|| unknown_handle(handle))?;
        // SAFETY: blocking write of exactly `data.len()` bytes into a buffer of that size.
        unsafe { state.queue.enqueue_write_buffer(buffer, CL_BLOCKING, 0, data, &[]) }
            .map(drop)
            .map_err(|e| RunnerError::resource("host-to-device copy", e))
    }

    fn copy_on_device(&mut self, dst: BufferHandle, src: BufferHandle) -> Result<()> {
        let state = self.state_mut()?;
        let (src_buf, dst_buf) = src_and_dst(&mut state.buffers, src.index(), dst.index())
            .ok_or_else(|| {
                RunnerError::resource(
                    "device-to-device copy",
                    format!("invalid handle pair {} -> {}", src.index(), dst.index()),
                )
            })?;
        let size = src_buf.size().map_err(|e| RunnerError::resource("querying buffer size", e))?;
        // SAFETY: both buffers were allocated with the same size.
        unsafe { state.queue.enqueue_copy_buffer(src_buf, dst_buf, 0, 0, size, &[]) }
            .map(drop)
            .map_err(|e| RunnerError::resource("device-to-device copy", e))
    }

    fn copy_to_host(&mut self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        let state = self.state()?;
        let buffer = state.buffer(handle)?;
        // SAFETY: blocking read into a host slice of the buffer's size.
        unsafe { state.queue.enqueue_read_buffer(buffer, CL_BLOCKING, 0, data, &[]) }
            .map(drop)
            .map_err(|e| RunnerError::resource("device-to-host copy", e))
    }

    fn zero_fill(&mut self, handle: BufferHandle) -> Result<()> {
        let state = self.state_mut()?;
        let buffer = state.buffers.get_mut(handle.index()).ok_or_else(|| unknown_handle(handle))?;
        let size = buffer.size().map_err(|e| RunnerError::resource("querying buffer size", e))?;
        // SAFETY: the fill covers exactly the buffer's extent.
        unsafe { state.queue.enqueue_fill_buffer(buffer, &[0u8], 0, size, &[]) }
            .map(drop)
            .map_err(|e| RunnerError::resource("zero-filling a device buffer", e))
    }

    fn launch(
        &mut self,
        arguments: &MarshalledArguments,
        config: &ResolvedLaunchConfig,
        timed: bool,
    ) -> Result<Option<Duration>> {
        arguments.require_convention(ArgumentConvention::ExplicitSizes)?;
        let state = self.state()?;
        let kernel = state.kernel.as_ref().ok_or_else(|| {
            RunnerError::resource("kernel launch", "no kernel has been built")
        })?;

        for (index, argument, size) in arguments.sized()? {
            match argument {
                KernelArgument::Buffer { handle, name } => {
                    if size != std::mem::size_of::<cl_mem>() {
                        return Err(RunnerError::resource(
                            "setting kernel argument",
                            format!("buffer `{name}` marshalled as {size} bytes"),
                        ));
                    }
                    let mem = state.buffer(*handle)?.get();
                    // SAFETY: `mem` is a live cl_mem owned by this backend.
                    unsafe { kernel.set_arg(index, &mem) }.map_err(|e| {
                        RunnerError::resource(format!("setting kernel argument {index} (`{name}`)"), e)
                    })?;
                }
                KernelArgument::Scalar { value, .. } => set_scalar_arg(kernel, index, value, size)?,
            }
        }

        let work_dim = config.work_dim();
        let global = config.dispatched();
        let local: [usize; 3] = config.block.map(|b| b as usize);
        debug!(?global, ?local, work_dim, "enqueueing OpenCL kernel");

        // SAFETY: all arguments are set; size arrays outlive the call.
        let event = unsafe {
            state.queue.enqueue_nd_range_kernel(
                kernel.get(),
                work_dim,
                ptr::null(),
                global.as_ptr(),
                local.as_ptr(),
                &[],
            )
        }
        .map_err(|e| RunnerError::resource("kernel launch", e))?;
        event.wait().map_err(|e| RunnerError::resource("waiting for kernel completion", e))?;

        if !timed {
            return Ok(None);
        }
        let start = event
            .profiling_command_start()
            .map_err(|e| RunnerError::resource("reading profiling start", e))?;
        let end = event
            .profiling_command_end()
            .map_err(|e| RunnerError::resource("reading profiling end", e))?;
        Ok(Some(Duration::from_nanos(end.saturating_sub(start))))
    }

    fn synchronize(&mut self) -> Result<()> {
        self.state()?
            .queue
            .finish()
            .map_err(|e| RunnerError::resource("OpenCL queue finish", e))
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut state) = self.state.take() else {
            warn!("OpenCL resources already released");
            return Ok(());
        };
        if let Err(e) = state.queue.finish() {
            warn!("OpenCL queue did not drain before release: {e}");
        }
        let buffers = state.buffers.len();
        state.buffers.clear();
        state.kernel = None;
        if state.program.take().is_some() {
            debug!("released OpenCL program");
        }
        drop(state);
        debug!(buffers, platform = self.platform_id, device = self.device_id, "released OpenCL context");
        Ok(())
    }
}

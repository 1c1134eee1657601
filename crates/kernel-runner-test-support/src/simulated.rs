use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kernel_runner_backends::{
    report_build_log, src_and_dst, ArgumentConvention, Backend, BufferHandle, BuildOutput,
    BuildRequest, DeviceSelection, KernelArgument, MarshalledArguments,
};
use kernel_runner_common::{Ecosystem, ResolvedLaunchConfig, Result, RunnerError, ScalarType};
use tracing::trace;

/// Time reported for every timed launch.
pub const SIMULATED_RUN_TIME: Duration = Duration::from_micros(250);

/// One call made on a [`SimulatedBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Build { entry_point: String, flags: Vec<String> },
    Allocate { name: String, size: usize, handle: BufferHandle },
    CopyToDevice { handle: BufferHandle },
    CopyOnDevice { dst: BufferHandle, src: BufferHandle },
    CopyToHost { handle: BufferHandle },
    ZeroFill { handle: BufferHandle },
    Launch { config: ResolvedLaunchConfig, arguments: Vec<String>, sizes: Option<Vec<usize>> },
    Synchronize,
    Release,
}

/// Shared record of backend calls, in order.
#[derive(Debug, Clone, Default)]
pub struct OperationLog(Arc<Mutex<Vec<Operation>>>);

impl OperationLog {
    fn record(&self, op: Operation) {
        trace!(?op, "simulated backend operation");
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(op);
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn count(&self, pred: impl Fn(&Operation) -> bool) -> usize {
        self.operations().iter().filter(|op| pred(op)).count()
    }

    pub fn launches(&self) -> usize {
        self.count(|op| matches!(op, Operation::Launch { .. }))
    }

    pub fn allocations(&self) -> Vec<(String, usize)> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                Operation::Allocate { name, size, .. } => Some((name, size)),
                _ => None,
            })
            .collect()
    }

    pub fn was_built(&self) -> bool {
        self.count(|op| matches!(op, Operation::Build { .. })) > 0
    }

    pub fn was_released(&self) -> bool {
        self.count(|op| matches!(op, Operation::Release)) > 0
    }
}

/// Host-side stand-in for a compiled kernel.
pub type HostKernel = Arc<dyn Fn(&mut KernelInvocation<'_>) -> Result<()> + Send + Sync>;

/// Arguments and device memory visible to a [`HostKernel`].
pub struct KernelInvocation<'a> {
    arguments: &'a [KernelArgument],
    memory: &'a mut [Vec<u8>],
    config: &'a ResolvedLaunchConfig,
}

impl KernelInvocation<'_> {
    pub fn config(&self) -> &ResolvedLaunchConfig {
        self.config
    }

    fn handle(&self, name: &str) -> Result<BufferHandle> {
        self.arguments
            .iter()
            .find_map(|arg| match arg {
                KernelArgument::Buffer { name: n, handle } if n == name => Some(*handle),
                _ => None,
            })
            .ok_or_else(|| RunnerError::MissingBuffer { name: name.to_string() })
    }

    /// Copy of the buffer argument `name`.
    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let handle = self.handle(name)?;
        self.memory
            .get(handle.index())
            .cloned()
            .ok_or_else(|| RunnerError::MissingBuffer { name: name.to_string() })
    }

    pub fn write(&mut self, name: &str) -> Result<&mut [u8]> {
        let handle = self.handle(name)?;
        self.memory
            .get_mut(handle.index())
            .map(Vec::as_mut_slice)
            .ok_or_else(|| RunnerError::MissingBuffer { name: name.to_string() })
    }

    pub fn scalar<T: ScalarType>(&self, name: &str) -> Result<T> {
        self.arguments
            .iter()
            .find_map(|arg| match arg {
                KernelArgument::Scalar { name: n, value } if n == name => Some(value),
                _ => None,
            })
            .ok_or_else(|| RunnerError::MissingScalar { name: name.to_string() })?
            .get(name)
    }
}

/// A backend whose device memory lives on the host.
#[derive(Clone)]
pub struct SimulatedBackend {
    ecosystem: Ecosystem,
    convention: ArgumentConvention,
    log: OperationLog,
    kernels: BTreeMap<String, HostKernel>,
    build_failure: Option<String>,
    emits_ir: bool,
    memory: Vec<Vec<u8>>,
    built: Option<String>,
    released: bool,
}

impl std::fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedBackend")
            .field("ecosystem", &self.ecosystem)
            .field("kernels", &self.kernels.keys().collect::<Vec<_>>())
            .field("buffers", &self.memory.len())
            .field("built", &self.built)
            .finish_non_exhaustive()
    }
}

impl SimulatedBackend {
    /// A backend using the argument convention of `ecosystem`.
    pub fn new(ecosystem: Ecosystem) -> Self {
        let convention = match ecosystem {
            Ecosystem::Cuda => ArgumentConvention::SentinelTerminated,
            Ecosystem::OpenCl => ArgumentConvention::ExplicitSizes,
        };
        Self {
            ecosystem,
            convention,
            log: OperationLog::default(),
            kernels: BTreeMap::new(),
            build_failure: None,
            emits_ir: true,
            memory: Vec::new(),
            built: None,
            released: false,
        }
    }

    /// Run `kernel` whenever the entry point `entry_point` is launched.
    pub fn with_kernel(
        mut self,
        entry_point: &str,
        kernel: impl Fn(&mut KernelInvocation<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.kernels.insert(entry_point.to_string(), Arc::new(kernel));
        self
    }

    /// Fail every build with `log` as the compiler output.
    pub fn with_build_failure(mut self, log: impl Into<String>) -> Self {
        self.build_failure = Some(log.into());
        self
    }

    pub fn without_ir(mut self) -> Self {
        self.emits_ir = false;
        self
    }

    pub fn log(&self) -> OperationLog {
        self.log.clone()
    }

    /// A backend factory handing out copies of this backend.
    ///
    /// Copies share the operation log.
    pub fn into_factory(self) -> impl Fn(&DeviceSelection) -> Result<Box<dyn Backend>> + 'static {
        move |selection: &DeviceSelection| {
            if selection.ecosystem != self.ecosystem {
                return Err(RunnerError::environment(format!(
                    "simulated {} backend cannot serve a {} selection",
                    self.ecosystem, selection.ecosystem
                )));
            }
            Ok(Box::new(self.clone()) as Box<dyn Backend>)
        }
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.released {
            return Err(RunnerError::resource(operation.to_string(), "backend already released"));
        }
        Ok(())
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&Vec<u8>> {
        self.memory.get(handle.index()).ok_or_else(|| unknown_handle(handle))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> Result<&mut Vec<u8>> {
        self.memory.get_mut(handle.index()).ok_or_else(|| unknown_handle(handle))
    }
}

fn unknown_handle(handle: BufferHandle) -> RunnerError {
    RunnerError::resource("buffer lookup", format!("no buffer with handle {}", handle.index()))
}

fn check_len(operation: &str, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(RunnerError::resource(
            operation.to_string(),
            format!("size mismatch: device buffer has {expected} bytes, host side {actual}"),
        ));
    }
    Ok(())
}

impl Backend for SimulatedBackend {
    fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    fn device_description(&self) -> String {
        format!("simulated {} device", self.ecosystem)
    }

    fn argument_convention(&self) -> ArgumentConvention {
        self.convention
    }

    fn build(&mut self, request: &BuildRequest<'_>) -> Result<BuildOutput> {
        self.ensure_live("kernel build")?;
        self.log.record(Operation::Build {
            entry_point: request.entry_point.to_string(),
            flags: request.definitions.compiler_flags(),
        });
        if let Some(log) = &self.build_failure {
            report_build_log(request.entry_point, log, false);
            return Err(RunnerError::Compilation {
                kernel: request.entry_point.to_string(),
                reason: log.clone(),
            });
        }
        self.built = Some(request.entry_point.to_string());
        let ir = self.emits_ir.then(|| {
            format!(".visible .entry {}()\n{{\n\tret;\n}}\n", request.entry_point)
        });
        Ok(BuildOutput { ir, log: String::new() })
    }

    fn allocate(&mut self, name: &str, size: usize) -> Result<BufferHandle> {
        self.ensure_live("buffer allocation")?;
        self.memory.push(vec![0; size]);
        let handle = BufferHandle::new(self.memory.len() - 1);
        self.log.record(Operation::Allocate { name: name.to_string(), size, handle });
        Ok(handle)
    }

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.buffer(handle)?.len())
    }

    fn copy_to_device(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()> {
        self.ensure_live("host-to-device copy")?;
        let dst = self.buffer_mut(handle)?;
        check_len("host-to-device copy", dst.len(), data.len())?;
        dst.copy_from_slice(data);
        self.log.record(Operation::CopyToDevice { handle });
        Ok(())
    }

    fn copy_on_device(&mut self, dst: BufferHandle, src: BufferHandle) -> Result<()> {
        self.ensure_live("device-to-device copy")?;
        let (from, to) = src_and_dst(&mut self.memory, src.index(), dst.index()).ok_or_else(|| {
            RunnerError::resource(
                "device-to-device copy",
                format!("invalid handles {} -> {}", src.index(), dst.index()),
            )
        })?;
        check_len("device-to-device copy", to.len(), from.len())?;
        to.copy_from_slice(from);
        self.log.record(Operation::CopyOnDevice { dst, src });
        Ok(())
    }

    fn copy_to_host(&mut self, handle: BufferHandle, data: &mut [u8]) -> Result<()> {
        self.ensure_live("device-to-host copy")?;
        let src = self.buffer(handle)?;
        check_len("device-to-host copy", src.len(), data.len())?;
        data.copy_from_slice(src);
        self.log.record(Operation::CopyToHost { handle });
        Ok(())
    }

    fn zero_fill(&mut self, handle: BufferHandle) -> Result<()> {
        self.ensure_live("buffer zero-fill")?;
        self.buffer_mut(handle)?.fill(0);
        self.log.record(Operation::ZeroFill { handle });
        Ok(())
    }

    fn launch(
        &mut self,
        arguments: &MarshalledArguments,
        config: &ResolvedLaunchConfig,
        timed: bool,
    ) -> Result<Option<Duration>> {
        self.ensure_live("kernel launch")?;
        arguments.require_convention(self.convention)?;
        let entry_point = self
            .built
            .clone()
            .ok_or_else(|| RunnerError::resource("kernel launch", "no kernel has been built"))?;
        self.log.record(Operation::Launch {
            config: *config,
            arguments: arguments.arguments().iter().map(|a| a.name().to_string()).collect(),
            sizes: arguments.sizes().map(<[usize]>::to_vec),
        });
        if let Some(kernel) = self.kernels.get(&entry_point).cloned() {
            let mut invocation = KernelInvocation {
                arguments: arguments.arguments(),
                memory: &mut self.memory,
                config,
            };
            kernel(&mut invocation)?;
        }
        Ok(timed.then_some(SIMULATED_RUN_TIME))
    }

    fn synchronize(&mut self) -> Result<()> {
        self.ensure_live("synchronization")?;
        self.log.record(Operation::Synchronize);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.ensure_live("release")?;
        self.memory.clear();
        self.built = None;
        self.released = true;
        self.log.record(Operation::Release);
        Ok(())
    }
}

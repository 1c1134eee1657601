//! The execution context: the single owned aggregate for one run.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use kernel_runner_backends::{ArgumentList, Backend, BufferHandle, MarshalledArguments};
use kernel_runner_common::{
    Ecosystem, PreprocessorDefinitions, ResolvedLaunchConfig, Result, RunOptions, RunnerError,
    ScalarType, ScalarValue,
};

use crate::adapter::{KernelAdapter, ParameterDirection, SizeInputs};

/// A pair of name-keyed maps, one per side of the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferMaps<T> {
    pub inputs: BTreeMap<String, T>,
    pub outputs: BTreeMap<String, T>,
}

impl<T> Default for BufferMaps<T> {
    fn default() -> Self {
        Self { inputs: BTreeMap::new(), outputs: BTreeMap::new() }
    }
}

/// Host bytes, device handles and file names of every buffer.
///
/// Inout buffers appear in both maps: on the device, the input-side entry is
/// the pristine copy and the output-side entry is the working copy.
#[derive(Debug, Clone, Default)]
pub struct Buffers {
    pub host: BufferMaps<Vec<u8>>,
    pub device: BufferMaps<BufferHandle>,
    pub filenames: BufferMaps<PathBuf>,
}

/// Scalar arguments as given and as parsed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarArguments {
    pub raw: BTreeMap<String, String>,
    pub typed: BTreeMap<String, ScalarValue>,
}

/// Everything one run owns, from backend handles to timing results.
pub struct ExecutionContext {
    pub(crate) options: RunOptions,
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) adapter: Box<dyn KernelAdapter>,
    pub(crate) buffers: Buffers,
    pub(crate) scalar_arguments: ScalarArguments,
    pub(crate) preprocessor_definitions: PreprocessorDefinitions,
    pub(crate) include_paths: Vec<PathBuf>,
    pub(crate) launch_config: Option<ResolvedLaunchConfig>,
    pub(crate) compiled_ir: Option<String>,
    pub(crate) marshalled_arguments: Option<MarshalledArguments>,
    pub(crate) run_timings: Vec<Duration>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("ecosystem", &self.ecosystem())
            .field("kernel", &self.adapter.key())
            .field("buffers", &self.buffers.filenames)
            .field("scalars", &self.scalar_arguments.typed)
            .field("launch_config", &self.launch_config)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new(
        options: RunOptions,
        backend: Box<dyn Backend>,
        adapter: Box<dyn KernelAdapter>,
    ) -> Self {
        Self {
            options,
            backend,
            adapter,
            buffers: Buffers::default(),
            scalar_arguments: ScalarArguments::default(),
            preprocessor_definitions: PreprocessorDefinitions::default(),
            include_paths: Vec::new(),
            launch_config: None,
            compiled_ir: None,
            marshalled_arguments: None,
            run_timings: Vec::new(),
        }
    }

    pub fn ecosystem(&self) -> Ecosystem {
        self.backend.ecosystem()
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    pub fn adapter(&self) -> &dyn KernelAdapter {
        self.adapter.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    pub fn buffers(&self) -> &Buffers {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut Buffers {
        &mut self.buffers
    }

    pub fn scalar_arguments(&self) -> &ScalarArguments {
        &self.scalar_arguments
    }

    pub fn scalar_arguments_mut(&mut self) -> &mut ScalarArguments {
        &mut self.scalar_arguments
    }

    pub fn preprocessor_definitions(&self) -> &PreprocessorDefinitions {
        &self.preprocessor_definitions
    }

    pub fn include_paths(&self) -> &[PathBuf] {
        &self.include_paths
    }

    pub fn launch_config(&self) -> Option<&ResolvedLaunchConfig> {
        self.launch_config.as_ref()
    }

    pub fn compiled_ir(&self) -> Option<&str> {
        self.compiled_ir.as_deref()
    }

    pub fn marshalled_arguments(&self) -> Option<&MarshalledArguments> {
        self.marshalled_arguments.as_ref()
    }

    pub fn run_timings(&self) -> &[Duration] {
        &self.run_timings
    }

    /// Host bytes of an input or inout buffer.
    pub fn host_input(&self, name: &str) -> Result<&[u8]> {
        self.buffers
            .host
            .inputs
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| RunnerError::MissingBuffer { name: name.to_string() })
    }

    /// Typed scalar argument `name`, read as `T`.
    pub fn scalar<T: ScalarType>(&self, name: &str) -> Result<T> {
        self.scalar_arguments
            .typed
            .get(name)
            .ok_or_else(|| RunnerError::MissingScalar { name: name.to_string() })?
            .get(name)
    }

    /// Inputs available to size calculators.
    pub fn size_inputs(&self) -> SizeInputs<'_> {
        SizeInputs {
            inputs: &self.buffers.host.inputs,
            scalars: &self.scalar_arguments.typed,
            definitions: &self.preprocessor_definitions,
        }
    }

    /// Device handle a kernel argument for buffer `name` must refer to.
    ///
    /// Output and inout buffers resolve to the working copy in the output map.
    pub fn argument_buffer(&self, name: &str) -> Result<BufferHandle> {
        let param = self.adapter.find_parameter(name).filter(|p| p.is_buffer()).ok_or_else(|| {
            RunnerError::configuration(format!(
                "kernel `{}` has no buffer parameter named `{name}`",
                self.adapter.key()
            ))
        })?;
        let map = if param.direction.is_output() {
            &self.buffers.device.outputs
        } else {
            &self.buffers.device.inputs
        };
        map.get(name).copied().ok_or_else(|| RunnerError::MissingBuffer { name: name.to_string() })
    }

    /// Append the device buffer `name` to `arguments`.
    pub fn marshal_buffer(&self, arguments: &mut ArgumentList, name: &str) -> Result<()> {
        let handle = self.argument_buffer(name)?;
        arguments.push_buffer(name, handle);
        Ok(())
    }

    /// Append the typed scalar `name` to `arguments`.
    pub fn marshal_scalar(&self, arguments: &mut ArgumentList, name: &str) -> Result<()> {
        let value = *self
            .scalar_arguments
            .typed
            .get(name)
            .ok_or_else(|| RunnerError::MissingScalar { name: name.to_string() })?;
        arguments.push_scalar(name, value);
        Ok(())
    }

    /// Names of buffers with the given directions, per the adapter schema.
    pub fn buffer_names(&self, directions: &[ParameterDirection]) -> Vec<&'static str> {
        self.adapter.buffer_names(directions)
    }
}

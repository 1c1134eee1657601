//! Kernel adapters, the execution context and the run sequence.
//!
//! A run goes through [`Orchestrator::run`]: the adapter registered under the
//! kernel key describes the parameters, the [`buffers`] functions move data
//! between host and device, and a [`kernel_runner_backends::Backend`] builds
//! and launches the kernel.

pub mod adapter;
pub mod buffers;
pub mod context;
pub mod io;
pub mod orchestrator;
pub mod registry;

pub use adapter::{
    validate_schema, KernelAdapter, ParameterDetails, ParameterDirection, ParameterKind,
    PreprocessorDefinitionDetails, SizeCalculator, SizeInputs,
};
pub use context::{BufferMaps, Buffers, ExecutionContext, ScalarArguments};
pub use io::{MemoryIo, RunnerIo};
pub use orchestrator::{
    default_cuda_include_dir, BackendFactory, Orchestrator, RunOutcome, RunReport,
    OUTPUT_FILE_EXTENSION,
};
pub use registry::{AdapterConstructor, AdapterRegistry};

//! Kernel argument lists and the per-ecosystem passing conventions.
//!
//! Adapters produce an [`ArgumentList`] in the entry point's parameter order.
//! The framework then finalizes it with the backend's [`ArgumentConvention`]:
//! CUDA takes one sentinel-terminated sequence of opaque references, OpenCL
//! sets each argument by index and needs its byte size.

use kernel_runner_common::{Result, RunnerError, ScalarValue};

use crate::backend::BufferHandle;

/// One kernel argument, before backend-specific finalization.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelArgument {
    /// A device buffer, passed by reference.
    Buffer { name: String, handle: BufferHandle },
    /// A scalar, passed by value.
    Scalar { name: String, value: ScalarValue },
}

impl KernelArgument {
    pub fn name(&self) -> &str {
        match self {
            Self::Buffer { name, .. } | Self::Scalar { name, .. } => name,
        }
    }

    /// Bytes the argument occupies in a kernel's parameter block.
    pub fn byte_size(&self) -> usize {
        match self {
            Self::Buffer { .. } => std::mem::size_of::<*mut std::ffi::c_void>(),
            Self::Scalar { value, .. } => value.byte_size(),
        }
    }
}

/// Ordered arguments as produced by an adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArgumentList {
    arguments: Vec<KernelArgument>,
}

impl ArgumentList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_buffer(&mut self, name: impl Into<String>, handle: BufferHandle) {
        self.arguments.push(KernelArgument::Buffer { name: name.into(), handle });
    }

    pub fn push_scalar(&mut self, name: impl Into<String>, value: ScalarValue) {
        self.arguments.push(KernelArgument::Scalar { name: name.into(), value });
    }

    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &KernelArgument> {
        self.arguments.iter()
    }
}

/// How a backend expects its argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentConvention {
    /// One opaque reference per argument followed by a terminator; no sizes.
    SentinelTerminated,
    /// Arguments set one index at a time, each with an explicit byte size.
    ExplicitSizes,
}

impl ArgumentConvention {
    /// Seal an adapter's list under this convention.
    pub fn finalize(self, list: ArgumentList) -> MarshalledArguments {
        match self {
            Self::SentinelTerminated => {
                MarshalledArguments { arguments: list.arguments, sizes: None, terminated: true }
            }
            Self::ExplicitSizes => {
                let sizes = list.arguments.iter().map(KernelArgument::byte_size).collect();
                MarshalledArguments { arguments: list.arguments, sizes: Some(sizes), terminated: false }
            }
        }
    }
}

/// Arguments ready to hand to a launch.
#[derive(Debug, Clone, PartialEq)]
pub struct MarshalledArguments {
    arguments: Vec<KernelArgument>,
    sizes: Option<Vec<usize>>,
    terminated: bool,
}

impl MarshalledArguments {
    pub fn arguments(&self) -> &[KernelArgument] {
        &self.arguments
    }

    /// Per-argument byte sizes, present only under [`ArgumentConvention::ExplicitSizes`].
    pub fn sizes(&self) -> Option<&[usize]> {
        self.sizes.as_deref()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn convention(&self) -> ArgumentConvention {
        if self.terminated {
            ArgumentConvention::SentinelTerminated
        } else {
            ArgumentConvention::ExplicitSizes
        }
    }

    /// Fail unless these arguments were sealed under `expected`.
    pub fn require_convention(&self, expected: ArgumentConvention) -> Result<()> {
        if self.convention() != expected {
            return Err(RunnerError::resource(
                "kernel launch",
                format!(
                    "arguments were marshalled as {:?}, backend requires {expected:?}",
                    self.convention()
                ),
            ));
        }
        Ok(())
    }

    /// Argument entries paired with their explicit sizes.
    pub fn sized(&self) -> Result<impl Iterator<Item = (u32, &KernelArgument, usize)>> {
        let sizes = self.sizes.as_deref().ok_or_else(|| {
            RunnerError::resource("kernel launch", "argument sizes were not marshalled")
        })?;
        Ok(self
            .arguments
            .iter()
            .zip(sizes.iter().copied())
            .enumerate()
            .map(|(i, (arg, size))| (i as u32, arg, size)))
    }
}

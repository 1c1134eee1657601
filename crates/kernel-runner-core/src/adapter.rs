//! The kernel adapter contract.
//!
//! An adapter describes one kernel: its parameters (buffers and scalars, with
//! directions and size calculators), the preprocessor definitions it expects,
//! how its arguments are marshalled and how its launch geometry is deduced.
//! Adapters are immutable once constructed.

use std::collections::BTreeMap;

use kernel_runner_backends::ArgumentList;
use kernel_runner_common::{
    LaunchConfigComponents, PreprocessorDefinitions, Result, RunnerError, ScalarKind, ScalarType,
    ScalarValue,
};

use crate::context::ExecutionContext;

/// Which way data flows through a buffer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterDirection {
    In,
    Out,
    InOut,
}

impl ParameterDirection {
    /// Read from a file before the run.
    pub fn is_input(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    /// Copied back after the run.
    pub fn is_output(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

impl std::fmt::Display for ParameterDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::In => write!(f, "input"),
            Self::Out => write!(f, "output"),
            Self::InOut => write!(f, "inout"),
        }
    }
}

/// Buffer or scalar, with the scalar's element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Buffer,
    Scalar(ScalarKind),
}

/// What a size calculator may look at.
#[derive(Debug, Clone, Copy)]
pub struct SizeInputs<'a> {
    pub inputs: &'a BTreeMap<String, Vec<u8>>,
    pub scalars: &'a BTreeMap<String, ScalarValue>,
    pub definitions: &'a PreprocessorDefinitions,
}

impl<'a> SizeInputs<'a> {
    pub fn input_size(&self, name: &str) -> Result<usize> {
        self.inputs
            .get(name)
            .map(Vec::len)
            .ok_or_else(|| RunnerError::MissingBuffer { name: name.to_string() })
    }

    pub fn scalar<T: ScalarType>(&self, name: &str) -> Result<T> {
        self.scalars
            .get(name)
            .ok_or_else(|| RunnerError::MissingScalar { name: name.to_string() })?
            .get(name)
    }

    /// A valued preprocessor definition parsed as `T`.
    pub fn definition<T: std::str::FromStr>(&self, name: &str) -> Result<T> {
        let raw = self
            .definitions
            .value_of(name)
            .ok_or_else(|| RunnerError::MissingDefinition { name: name.to_string() })?;
        raw.trim().parse().map_err(|_| {
            RunnerError::validation(format!(
                "preprocessor definition {name}={raw} does not have the expected form"
            ))
        })
    }
}

/// Computes the byte size of an output or inout buffer.
///
/// Calculators are pure: no device work, no I/O.
#[derive(Clone, Copy)]
pub enum SizeCalculator {
    /// Same size as the named input (or inout) buffer.
    SameAsInput(&'static str),
    Custom(fn(&SizeInputs<'_>) -> Result<usize>),
}

impl SizeCalculator {
    pub fn compute(&self, inputs: &SizeInputs<'_>) -> Result<usize> {
        match self {
            Self::SameAsInput(name) => inputs.input_size(name),
            Self::Custom(f) => f(inputs),
        }
    }
}

impl std::fmt::Debug for SizeCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SameAsInput(name) => f.debug_tuple("SameAsInput").field(name).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One entry of a kernel's parameter schema.
#[derive(Debug, Clone)]
pub struct ParameterDetails {
    pub name: &'static str,
    pub kind: ParameterKind,
    pub direction: ParameterDirection,
    pub size_calculator: Option<SizeCalculator>,
    pub required: bool,
    pub description: &'static str,
}

impl ParameterDetails {
    pub const fn input_buffer(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind: ParameterKind::Buffer,
            direction: ParameterDirection::In,
            size_calculator: None,
            required: true,
            description,
        }
    }

    pub const fn output_buffer(
        name: &'static str,
        size_calculator: SizeCalculator,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: ParameterKind::Buffer,
            direction: ParameterDirection::Out,
            size_calculator: Some(size_calculator),
            required: true,
            description,
        }
    }

    /// An inout buffer keeps the size of the file it was read from.
    pub const fn inout_buffer(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            kind: ParameterKind::Buffer,
            direction: ParameterDirection::InOut,
            size_calculator: Some(SizeCalculator::SameAsInput(name)),
            required: true,
            description,
        }
    }

    pub const fn scalar(
        name: &'static str,
        kind: ScalarKind,
        required: bool,
        description: &'static str,
    ) -> Self {
        Self {
            name,
            kind: ParameterKind::Scalar(kind),
            direction: ParameterDirection::In,
            size_calculator: None,
            required,
            description,
        }
    }

    pub fn is_buffer(&self) -> bool {
        self.kind == ParameterKind::Buffer
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self.kind {
            ParameterKind::Scalar(kind) => Some(kind),
            ParameterKind::Buffer => None,
        }
    }
}

/// A preprocessor term the kernel source refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessorDefinitionDetails {
    pub name: &'static str,
    pub required: bool,
    pub description: &'static str,
}

impl PreprocessorDefinitionDetails {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self { name, required: true, description }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self { name, required: false, description }
    }
}

/// Per-kernel schema and hooks.
pub trait KernelAdapter: Send + Sync {
    /// Registry key; unique per process.
    fn key(&self) -> &'static str;

    /// Name of the compiled entry point.
    fn entry_point_name(&self) -> &'static str {
        self.key()
    }

    /// Every parameter, in declaration order.
    fn parameter_details(&self) -> &[ParameterDetails];

    fn preprocessor_definition_details(&self) -> &[PreprocessorDefinitionDetails] {
        &[]
    }

    /// Convert a raw command-line value for scalar `name`.
    fn parse_scalar_argument(&self, name: &str, raw: &str) -> Result<ScalarValue> {
        let kind = self
            .find_parameter(name)
            .and_then(ParameterDetails::scalar_kind)
            .ok_or_else(|| {
                RunnerError::configuration(format!(
                    "kernel `{}` has no scalar parameter named `{name}`",
                    self.key()
                ))
            })?;
        kind.parse(name, raw)
    }

    /// Whether the input buffers have sizes this kernel can work with.
    fn input_sizes_are_valid(&self, _context: &ExecutionContext) -> bool {
        true
    }

    /// Cross-parameter invariants over buffers, scalars and definitions.
    fn extra_validity_checks(&self, _context: &ExecutionContext) -> bool {
        true
    }

    /// Scalars derived from everything else, added before marshalling.
    fn generate_additional_scalar_arguments(
        &self,
        _context: &ExecutionContext,
    ) -> Result<BTreeMap<String, ScalarValue>> {
        Ok(BTreeMap::new())
    }

    /// Push the kernel's arguments in the entry point's parameter order.
    ///
    /// The default follows the schema's declaration order.
    fn marshal_kernel_arguments(
        &self,
        context: &ExecutionContext,
        arguments: &mut ArgumentList,
    ) -> Result<()> {
        for param in self.parameter_details() {
            if param.is_buffer() {
                context.marshal_buffer(arguments, param.name)?;
            } else {
                context.marshal_scalar(arguments, param.name)?;
            }
        }
        Ok(())
    }

    /// Launch geometry when the forced components are not sufficient.
    fn deduce_launch_config(&self, context: &ExecutionContext) -> Result<LaunchConfigComponents> {
        let forced = context.options().forced_launch_config;
        if forced.is_sufficient() {
            return Ok(forced);
        }
        let missing = if forced.block.is_none() {
            "the block dimensions"
        } else {
            "either the grid or the overall dimensions"
        };
        Err(RunnerError::UndeducibleLaunchConfig {
            kernel: self.key().to_string(),
            missing: missing.into(),
        })
    }

    fn find_parameter(&self, name: &str) -> Option<&ParameterDetails> {
        self.parameter_details().iter().find(|p| p.name == name)
    }

    fn buffer_details(&self) -> Vec<&ParameterDetails> {
        self.parameter_details().iter().filter(|p| p.is_buffer()).collect()
    }

    fn scalar_details(&self) -> Vec<&ParameterDetails> {
        self.parameter_details().iter().filter(|p| !p.is_buffer()).collect()
    }

    /// Buffer names whose direction is one of `directions`.
    fn buffer_names(&self, directions: &[ParameterDirection]) -> Vec<&'static str> {
        self.parameter_details()
            .iter()
            .filter(|p| p.is_buffer() && directions.contains(&p.direction))
            .map(|p| p.name)
            .collect()
    }

    fn required_scalar_names(&self) -> Vec<&'static str> {
        self.scalar_details().into_iter().filter(|p| p.required).map(|p| p.name).collect()
    }

    fn required_definition_names(&self) -> Vec<&'static str> {
        self.preprocessor_definition_details()
            .iter()
            .filter(|d| d.required)
            .map(|d| d.name)
            .collect()
    }
}

/// Reject schemas with repeated or empty names.
pub fn validate_schema(adapter: &dyn KernelAdapter) -> Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for param in adapter.parameter_details() {
        if param.name.is_empty() || !seen.insert(param.name) {
            return Err(RunnerError::configuration(format!(
                "kernel `{}` declares parameter `{}` more than once or with an empty name",
                adapter.key(),
                param.name
            )));
        }
        if param.direction.is_output() && param.size_calculator.is_none() {
            return Err(RunnerError::configuration(format!(
                "kernel `{}` declares {} buffer `{}` without a size calculator",
                adapter.key(),
                param.direction,
                param.name
            )));
        }
    }
    Ok(())
}

use std::collections::BTreeMap;

use kernel_runner_backends::ArgumentList;
use kernel_runner_common::{LaunchConfigComponents, Result, ScalarValue};
use kernel_runner_core::{ExecutionContext, KernelAdapter, ParameterDetails, SizeCalculator};
use tracing::warn;

use crate::launch::{element_count, length_argument, one_thread_per_element, LENGTH};

/// `c = a + b` over `float` elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct VectorAdd;

static PARAMETERS: [ParameterDetails; 3] = [
    ParameterDetails::input_buffer("a", "first summand"),
    ParameterDetails::input_buffer("b", "second summand"),
    ParameterDetails::output_buffer("c", SizeCalculator::SameAsInput("a"), "elementwise sum"),
];

impl KernelAdapter for VectorAdd {
    fn key(&self) -> &'static str {
        "vector_add"
    }

    fn parameter_details(&self) -> &[ParameterDetails] {
        &PARAMETERS
    }

    fn input_sizes_are_valid(&self, context: &ExecutionContext) -> bool {
        match (context.host_input("a"), context.host_input("b")) {
            (Ok(a), Ok(b)) if a.len() == b.len() && a.len() % 4 == 0 => true,
            (Ok(a), Ok(b)) => {
                warn!("vector_add inputs have {} and {} bytes", a.len(), b.len());
                false
            }
            _ => false,
        }
    }

    fn generate_additional_scalar_arguments(
        &self,
        context: &ExecutionContext,
    ) -> Result<BTreeMap<String, ScalarValue>> {
        Ok(BTreeMap::from([(LENGTH.to_string(), length_argument(context, "a")?)]))
    }

    /// `a`, `b`, `c`, then the element count the kernel bounds its threads by.
    fn marshal_kernel_arguments(
        &self,
        context: &ExecutionContext,
        arguments: &mut ArgumentList,
    ) -> Result<()> {
        for name in ["a", "b", "c"] {
            context.marshal_buffer(arguments, name)?;
        }
        context.marshal_scalar(arguments, LENGTH)
    }

    fn deduce_launch_config(&self, context: &ExecutionContext) -> Result<LaunchConfigComponents> {
        one_thread_per_element(context, element_count(context, "a")?)
    }
}

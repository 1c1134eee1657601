use std::collections::BTreeMap;

use kernel_runner_backends::ArgumentList;
use kernel_runner_common::{LaunchConfigComponents, Result, ScalarKind, ScalarValue};
use kernel_runner_core::{ExecutionContext, KernelAdapter, ParameterDetails};

use crate::launch::{element_count, length_argument, one_thread_per_element, LENGTH};

/// `y = a * x + y`, updating `y` in place.
#[derive(Debug, Default, Clone, Copy)]
pub struct Saxpy;

static PARAMETERS: [ParameterDetails; 3] = [
    ParameterDetails::scalar("a", ScalarKind::F32, true, "scaling factor"),
    ParameterDetails::input_buffer("x", "scaled vector"),
    ParameterDetails::inout_buffer("y", "accumulated vector"),
];

impl KernelAdapter for Saxpy {
    fn key(&self) -> &'static str {
        "saxpy"
    }

    fn parameter_details(&self) -> &[ParameterDetails] {
        &PARAMETERS
    }

    fn input_sizes_are_valid(&self, context: &ExecutionContext) -> bool {
        match (context.host_input("x"), context.host_input("y")) {
            (Ok(x), Ok(y)) => x.len() == y.len() && x.len() % 4 == 0,
            _ => false,
        }
    }

    fn extra_validity_checks(&self, context: &ExecutionContext) -> bool {
        context.scalar::<f32>("a").map(f32::is_finite).unwrap_or(false)
    }

    fn generate_additional_scalar_arguments(
        &self,
        context: &ExecutionContext,
    ) -> Result<BTreeMap<String, ScalarValue>> {
        Ok(BTreeMap::from([(LENGTH.to_string(), length_argument(context, "x")?)]))
    }

    fn marshal_kernel_arguments(
        &self,
        context: &ExecutionContext,
        arguments: &mut ArgumentList,
    ) -> Result<()> {
        context.marshal_scalar(arguments, "a")?;
        context.marshal_buffer(arguments, "x")?;
        context.marshal_buffer(arguments, "y")?;
        context.marshal_scalar(arguments, LENGTH)
    }

    fn deduce_launch_config(&self, context: &ExecutionContext) -> Result<LaunchConfigComponents> {
        one_thread_per_element(context, element_count(context, "x")?)
    }
}

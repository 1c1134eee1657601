use kernel_runner_common::{LaunchConfigComponents, Result, ScalarKind};
use kernel_runner_core::{
    ExecutionContext, KernelAdapter, ParameterDetails, PreprocessorDefinitionDetails,
    SizeCalculator, SizeInputs,
};

use crate::launch::one_thread_per_element;

/// Writes the compile-time `FILL_VALUE` into `count` words.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fill;

fn data_size(inputs: &SizeInputs<'_>) -> Result<usize> {
    Ok(inputs.scalar::<u32>("count")? as usize * std::mem::size_of::<u32>())
}

static PARAMETERS: [ParameterDetails; 2] = [
    ParameterDetails::output_buffer("data", SizeCalculator::Custom(data_size), "filled words"),
    ParameterDetails::scalar("count", ScalarKind::U32, true, "number of words to fill"),
];

static DEFINITIONS: [PreprocessorDefinitionDetails; 1] =
    [PreprocessorDefinitionDetails::required("FILL_VALUE", "value written to every word")];

impl KernelAdapter for Fill {
    fn key(&self) -> &'static str {
        "fill"
    }

    fn parameter_details(&self) -> &[ParameterDetails] {
        &PARAMETERS
    }

    fn preprocessor_definition_details(&self) -> &[PreprocessorDefinitionDetails] {
        &DEFINITIONS
    }

    fn deduce_launch_config(&self, context: &ExecutionContext) -> Result<LaunchConfigComponents> {
        one_thread_per_element(context, context.scalar::<u32>("count")? as usize)
    }
}

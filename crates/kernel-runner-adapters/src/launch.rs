use kernel_runner_common::{LaunchConfigComponents, Result, RunnerError, ScalarValue};
use kernel_runner_core::ExecutionContext;

/// Generated scalar bounding the thread index of element-wise kernels.
pub(crate) const LENGTH: &str = "length";

/// Block size used when the user forced none.
pub const DEFAULT_BLOCK_SIZE: u32 = 256;

/// One thread per element along x, keeping whatever the user forced.
pub(crate) fn one_thread_per_element(
    context: &ExecutionContext,
    elements: usize,
) -> Result<LaunchConfigComponents> {
    let mut components = context.options().forced_launch_config;
    if components.block.is_none() {
        components.block = Some([DEFAULT_BLOCK_SIZE, 1, 1]);
    }
    if components.grid.is_none() && components.overall.is_none() {
        let elements = u32::try_from(elements).map_err(|_| {
            RunnerError::validation(format!("{elements} elements do not fit a launch grid"))
        })?;
        components.overall = Some([elements.max(1), 1, 1]);
    }
    Ok(components)
}

/// Number of 4-byte elements in buffer `name`, which must be a whole number of them.
pub(crate) fn element_count(context: &ExecutionContext, name: &str) -> Result<usize> {
    let bytes = context.host_input(name)?.len();
    if bytes % 4 != 0 {
        return Err(RunnerError::validation(format!(
            "buffer `{name}` has {bytes} bytes, not a whole number of 4-byte elements"
        )));
    }
    Ok(bytes / 4)
}

/// Element count of buffer `name` as the `length` scalar a bounds-checked kernel takes.
pub(crate) fn length_argument(context: &ExecutionContext, name: &str) -> Result<ScalarValue> {
    let elements = element_count(context, name)?;
    let length = u32::try_from(elements).map_err(|_| {
        RunnerError::validation(format!(
            "{} over {elements} elements overflows the length",
            context.adapter().key()
        ))
    })?;
    Ok(ScalarValue::U32(length))
}

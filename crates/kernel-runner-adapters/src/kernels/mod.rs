//! Kernel sources for the built-in adapters.
//!
//! Sources are embedded at compile time via `include_str!`; the files under
//! this directory are also what `--kernel-source` points at when running the
//! built-in kernels from a checkout.

use kernel_runner_common::Ecosystem;

pub const VECTOR_ADD_CU: &str = include_str!("vector_add.cu");
pub const VECTOR_ADD_CL: &str = include_str!("vector_add.cl");
pub const SAXPY_CU: &str = include_str!("saxpy.cu");
pub const SAXPY_CL: &str = include_str!("saxpy.cl");
pub const FILL_CU: &str = include_str!("fill.cu");
pub const FILL_CL: &str = include_str!("fill.cl");

/// The bundled source for a built-in kernel key.
pub fn bundled_source(key: &str, ecosystem: Ecosystem) -> Option<&'static str> {
    let source = match (key, ecosystem) {
        ("vector_add", Ecosystem::Cuda) => VECTOR_ADD_CU,
        ("vector_add", Ecosystem::OpenCl) => VECTOR_ADD_CL,
        ("saxpy", Ecosystem::Cuda) => SAXPY_CU,
        ("saxpy", Ecosystem::OpenCl) => SAXPY_CL,
        ("fill", Ecosystem::Cuda) => FILL_CU,
        ("fill", Ecosystem::OpenCl) => FILL_CL,
        _ => return None,
    };
    Some(source)
}

//! Build, memory and launch drivers for the two GPU ecosystems.
//!
//! The [`Backend`] trait is the only surface the orchestrator sees; the
//! ecosystem is picked once by [`open_backend`] and never branched on again.

pub mod arguments;
pub mod backend;
pub mod gpu;

pub use arguments::{ArgumentConvention, ArgumentList, KernelArgument, MarshalledArguments};
pub use backend::{
    build_log_level, report_build_log, src_and_dst, Backend, BufferHandle, BuildOutput,
    BuildRequest, CompilationFlags, DeviceSelection,
};

use kernel_runner_common::{Ecosystem, Result, RunnerError};
use tracing::info;

/// Whether an OpenCL platform builds through PTX, and so can emit it as IR.
pub fn platform_emits_ptx(platform_name: &str) -> bool {
    platform_name.to_lowercase().contains("nvidia")
}

/// Validate the device selection and open the matching backend.
pub fn open_backend(selection: &DeviceSelection) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match selection.ecosystem {
        Ecosystem::Cuda => open_cuda(selection)?,
        Ecosystem::OpenCl => open_opencl(selection)?,
    };
    info!("using {}", backend.device_description());
    Ok(backend)
}

#[cfg_attr(all(feature = "cuda", feature = "opencl"), allow(dead_code))]
fn unavailable(ecosystem: Ecosystem) -> RunnerError {
    RunnerError::EcosystemUnavailable {
        ecosystem: ecosystem.to_string(),
        feature: ecosystem.feature_name(),
    }
}

#[cfg(feature = "cuda")]
fn open_cuda(selection: &DeviceSelection) -> Result<Box<dyn Backend>> {
    Ok(Box::new(gpu::CudaBackend::open(selection.device_id)?))
}

#[cfg(not(feature = "cuda"))]
fn open_cuda(_selection: &DeviceSelection) -> Result<Box<dyn Backend>> {
    Err(unavailable(Ecosystem::Cuda))
}

#[cfg(feature = "opencl")]
fn open_opencl(selection: &DeviceSelection) -> Result<Box<dyn Backend>> {
    Ok(Box::new(gpu::OpenClBackend::open(
        selection.platform_id,
        selection.device_id,
        selection.need_ir,
    )?))
}

#[cfg(not(feature = "opencl"))]
fn open_opencl(_selection: &DeviceSelection) -> Result<Box<dyn Backend>> {
    Err(unavailable(Ecosystem::OpenCl))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptx_platforms() {
        assert!(platform_emits_ptx("NVIDIA CUDA"));
        assert!(!platform_emits_ptx("Intel(R) OpenCL Graphics"));
        assert!(!platform_emits_ptx("AMD Accelerated Parallel Processing"));
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn cuda_without_feature_is_an_environment_error() {
        let selection = DeviceSelection {
            ecosystem: Ecosystem::Cuda,
            platform_id: None,
            device_id: 0,
            need_ir: false,
        };
        let err = open_backend(&selection).err().unwrap();
        assert_eq!(err.kind(), kernel_runner_common::ErrorKind::Environment);
        assert!(err.to_string().contains("`cuda` feature"));
    }

    #[cfg(not(feature = "opencl"))]
    #[test]
    fn opencl_without_feature_is_an_environment_error() {
        let selection = DeviceSelection {
            ecosystem: Ecosystem::OpenCl,
            platform_id: Some(0),
            device_id: 0,
            need_ir: true,
        };
        let err = open_backend(&selection).err().unwrap();
        assert_eq!(err.kind(), kernel_runner_common::ErrorKind::Environment);
    }
}

//! Native GPU backends, each behind its own cargo feature.

#[cfg(feature = "cuda")]
pub mod cuda;
#[cfg(feature = "opencl")]
pub mod opencl;

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
#[cfg(feature = "opencl")]
pub use opencl::OpenClBackend;

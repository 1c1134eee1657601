//! Test fixtures for the kernel runner.
//!
//! [`SimulatedBackend`] implements the backend contract over host memory and
//! records every operation in an [`OperationLog`], so ordering guarantees can
//! be asserted without a GPU.

pub mod simulated;

pub use simulated::{
    HostKernel, KernelInvocation, Operation, OperationLog, SimulatedBackend, SIMULATED_RUN_TIME,
};

//! Shared types for the GPU kernel runner.
//!
//! This crate is backend-agnostic: it knows nothing about CUDA or OpenCL
//! beyond the [`Ecosystem`] tag.

pub mod config;
pub mod ecosystem;
pub mod error;
pub mod launch;
pub mod options;
pub mod preprocessor;
pub mod scalar;

pub use config::{LogLevel, RunnerConfig, RunnerConfigError};
pub use ecosystem::Ecosystem;
pub use error::{ErrorKind, Result, RunnerError};
pub use launch::{pad_dims, Dims, LaunchConfigComponents, ResolvedLaunchConfig};
pub use options::{
    clip_key, is_valid_identifier, BufferBasePaths, KernelIdentity, LanguageStandard, RunOptions,
};
pub use preprocessor::PreprocessorDefinitions;
pub use scalar::{ScalarKind, ScalarType, ScalarValue};

//! Error taxonomy shared by every kernel-runner crate.
//!
//! Each variant belongs to exactly one [`ErrorKind`]. The binary maps the kind
//! to a process exit code; library code only ever propagates.

use crate::scalar::ScalarKind;

/// Coarse classification of a fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad or missing option value, ambiguous launch-configuration sources.
    Configuration,
    /// No devices, invalid device or platform index.
    Environment,
    /// Kernel build failure.
    Compilation,
    /// Missing required buffer or scalar, failed adapter cross-checks.
    Validation,
    /// Allocation, copy or launch failure.
    Resource,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Environment => write!(f, "environment"),
            Self::Compilation => write!(f, "compilation"),
            Self::Validation => write!(f, "validation"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

/// Errors raised while preparing or executing a kernel run.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    #[error("ambiguous launch configuration: {reason}")]
    AmbiguousLaunchConfig { reason: String },

    #[error("unable to deduce the launch configuration for kernel `{kernel}`; please specify {missing} explicitly")]
    UndeducibleLaunchConfig { kernel: String, missing: String },

    #[error("no kernel adapter registered under key `{key}`")]
    UnknownKernel { key: String },

    #[error("required preprocessor definition `{name}` was not provided")]
    MissingDefinition { name: String },

    #[error("cannot parse value `{raw}` for scalar argument `{name}` as {kind}")]
    ScalarParse {
        name: String,
        raw: String,
        kind: ScalarKind,
    },

    #[error("destination `{path}` exists and overwriting is not allowed")]
    OverwriteRefused { path: String },

    #[error("environment error: {reason}")]
    Environment { reason: String },

    #[error("ecosystem `{ecosystem}` is not available in this build (enable the `{feature}` feature)")]
    EcosystemUnavailable {
        ecosystem: String,
        feature: &'static str,
    },

    #[error("failed to build kernel `{kernel}`: {reason}")]
    Compilation { kernel: String, reason: String },

    #[error("required buffer `{name}` is missing")]
    MissingBuffer { name: String },

    #[error("required scalar argument `{name}` was not provided")]
    MissingScalar { name: String },

    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("scalar `{name}` holds a {actual} value but was read as {expected}")]
    ScalarTypeMismatch {
        name: String,
        expected: ScalarKind,
        actual: ScalarKind,
    },

    #[error("buffer `{name}` has size {actual} bytes, expected {expected}")]
    BufferSizeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("{operation} failed: {reason}")]
    Resource { operation: String, reason: String },

    #[error("I/O error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunnerError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. }
            | Self::AmbiguousLaunchConfig { .. }
            | Self::UndeducibleLaunchConfig { .. }
            | Self::UnknownKernel { .. }
            | Self::MissingDefinition { .. }
            | Self::ScalarParse { .. }
            | Self::OverwriteRefused { .. } => ErrorKind::Configuration,
            Self::Environment { .. } | Self::EcosystemUnavailable { .. } => ErrorKind::Environment,
            Self::Compilation { .. } => ErrorKind::Compilation,
            Self::MissingBuffer { .. }
            | Self::MissingScalar { .. }
            | Self::Validation { .. }
            | Self::ScalarTypeMismatch { .. } => ErrorKind::Validation,
            Self::BufferSizeMismatch { .. } | Self::Resource { .. } | Self::Io { .. } => {
                ErrorKind::Resource
            }
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    pub fn environment(reason: impl Into<String>) -> Self {
        Self::Environment { reason: reason.into() }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    pub fn resource(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Resource { operation: operation.into(), reason: reason.to_string() }
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io { path: path.as_ref().display().to_string(), source }
    }
}

/// Result type used throughout the kernel runner.
pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(RunnerError::configuration("x").kind(), ErrorKind::Configuration);
        assert_eq!(
            RunnerError::UnknownKernel { key: "nope".into() }.kind(),
            ErrorKind::Configuration
        );
        assert_eq!(RunnerError::environment("no devices").kind(), ErrorKind::Environment);
        assert_eq!(
            RunnerError::Compilation { kernel: "k".into(), reason: "syntax".into() }.kind(),
            ErrorKind::Compilation
        );
        assert_eq!(RunnerError::MissingScalar { name: "n".into() }.kind(), ErrorKind::Validation);
        assert_eq!(RunnerError::resource("copy", "oops").kind(), ErrorKind::Resource);
    }

    #[test]
    fn messages_name_the_offender() {
        let err = RunnerError::MissingDefinition { name: "TILE".into() };
        assert!(err.to_string().contains("TILE"));

        let err = RunnerError::UndeducibleLaunchConfig {
            kernel: "vector_add".into(),
            missing: "the block dimensions".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("vector_add"));
        assert!(msg.contains("explicitly"));
    }
}

//! Process exit codes, one per error kind.

use kernel_runner_common::{ErrorKind, RunnerConfigError, RunnerError};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_GENERIC_FAIL: i32 = 1;
pub const EXIT_CONFIGURATION: i32 = 2;
pub const EXIT_ENVIRONMENT: i32 = 3;
pub const EXIT_COMPILATION: i32 = 4;
pub const EXIT_VALIDATION: i32 = 5;
pub const EXIT_RESOURCE: i32 = 6;

pub fn for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Configuration => EXIT_CONFIGURATION,
        ErrorKind::Environment => EXIT_ENVIRONMENT,
        ErrorKind::Compilation => EXIT_COMPILATION,
        ErrorKind::Validation => EXIT_VALIDATION,
        ErrorKind::Resource => EXIT_RESOURCE,
    }
}

/// Exit code for the first classifiable error in the chain.
pub fn for_error(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<RunnerError>() {
            return for_kind(e.kind());
        }
        if cause.downcast_ref::<RunnerConfigError>().is_some() {
            return EXIT_CONFIGURATION;
        }
    }
    EXIT_GENERIC_FAIL
}

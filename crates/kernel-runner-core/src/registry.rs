//! Kernel adapter registry.
//!
//! Built once at startup and read-only afterwards; every run produces a fresh
//! adapter instance from the registered constructor.

use std::collections::BTreeMap;

use kernel_runner_common::{Result, RunnerError};
use tracing::trace;

use crate::adapter::{validate_schema, KernelAdapter};

/// Produces a fresh adapter.
pub type AdapterConstructor = fn() -> Box<dyn KernelAdapter>;

#[derive(Default, Clone)]
pub struct AdapterRegistry {
    constructors: BTreeMap<String, AdapterConstructor>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `constructor` under `key`. Keys must be unique.
    pub fn register(&mut self, key: &str, constructor: AdapterConstructor) -> Result<()> {
        if self.constructors.contains_key(key) {
            return Err(RunnerError::configuration(format!(
                "a kernel adapter is already registered under `{key}`"
            )));
        }
        validate_schema(constructor().as_ref())?;
        trace!(key, "registered kernel adapter");
        self.constructors.insert(key.to_string(), constructor);
        Ok(())
    }

    /// Register `A` under its own key.
    pub fn register_adapter<A>(&mut self) -> Result<()>
    where
        A: KernelAdapter + Default + 'static,
    {
        let key = A::default().key();
        self.register(key, || -> Box<dyn KernelAdapter> { Box::new(A::default()) })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.constructors.contains_key(key)
    }

    /// A fresh adapter for `key`.
    pub fn produce(&self, key: &str) -> Result<Box<dyn KernelAdapter>> {
        self.constructors
            .get(key)
            .map(|constructor| constructor())
            .ok_or_else(|| RunnerError::UnknownKernel { key: key.to_string() })
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ParameterDetails;
    use kernel_runner_common::ErrorKind;

    #[derive(Default)]
    struct CopyKernel;

    static COPY_PARAMS: [ParameterDetails; 2] = [
        ParameterDetails::input_buffer("src", "source"),
        ParameterDetails::output_buffer(
            "dst",
            crate::adapter::SizeCalculator::SameAsInput("src"),
            "destination",
        ),
    ];

    impl KernelAdapter for CopyKernel {
        fn key(&self) -> &'static str {
            "copy"
        }
        fn parameter_details(&self) -> &[ParameterDetails] {
            &COPY_PARAMS
        }
    }

    #[test]
    fn produce_registered_adapter() {
        let mut registry = AdapterRegistry::new();
        registry.register_adapter::<CopyKernel>().unwrap();
        assert!(registry.contains("copy"));
        assert_eq!(registry.produce("copy").unwrap().key(), "copy");
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["copy"]);
    }

    #[test]
    fn unknown_key_is_a_configuration_error() {
        let registry = AdapterRegistry::new();
        let err = registry.produce("nope").err().expect("expected an error");
        assert!(matches!(err, RunnerError::UnknownKernel { ref key } if key == "nope"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = AdapterRegistry::new();
        registry.register_adapter::<CopyKernel>().unwrap();
        let err = registry.register_adapter::<CopyKernel>().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(registry.len(), 1);
    }
}

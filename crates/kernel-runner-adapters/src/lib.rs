//! Built-in kernel adapters.
//!
//! Adapters are registered explicitly, once, before the first lookup:
//!
//! ```
//! let registry = kernel_runner_adapters::builtin_registry().unwrap();
//! assert!(registry.contains("vector_add"));
//! ```

pub mod fill;
pub mod kernels;
mod launch;
pub mod saxpy;
pub mod vector_add;

pub use fill::Fill;
pub use kernels::bundled_source;
pub use launch::DEFAULT_BLOCK_SIZE;
pub use saxpy::Saxpy;
pub use vector_add::VectorAdd;

use kernel_runner_common::Result;
use kernel_runner_core::AdapterRegistry;

/// Register every built-in adapter under its key.
pub fn register_builtin_adapters(registry: &mut AdapterRegistry) -> Result<()> {
    registry.register_adapter::<VectorAdd>()?;
    registry.register_adapter::<Saxpy>()?;
    registry.register_adapter::<Fill>()?;
    Ok(())
}

/// A registry holding only the built-in adapters.
pub fn builtin_registry() -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();
    register_builtin_adapters(&mut registry)?;
    Ok(registry)
}

use std::fs;
use std::path::Path;

use kernel_runner_common::{Result, RunnerError};
use kernel_runner_core::RunnerIo;
use tracing::debug;

/// [`RunnerIo`] over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsIo;

impl RunnerIo for FsIo {
    fn read_kernel_source(&mut self, path: &Path) -> Result<String> {
        debug!("reading kernel source from {}", path.display());
        fs::read_to_string(path).map_err(|e| RunnerError::io(path, e))
    }

    fn read_buffer(&mut self, name: &str, path: &Path) -> Result<Vec<u8>> {
        let bytes = fs::read(path).map_err(|e| RunnerError::io(path, e))?;
        debug!("read buffer '{name}' of size {} bytes from {}", bytes.len(), path.display());
        Ok(bytes)
    }

    fn write_buffer(&mut self, name: &str, path: &Path, data: &[u8]) -> Result<()> {
        debug!("writing buffer '{name}' ({} bytes) to {}", data.len(), path.display());
        fs::write(path, data).map_err(|e| RunnerError::io(path, e))
    }

    fn write_ir(&mut self, path: &Path, ir: &str) -> Result<()> {
        fs::write(path, ir).map_err(|e| RunnerError::io(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

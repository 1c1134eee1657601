//! The I/O collaborator: the orchestrator never touches the filesystem itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kernel_runner_common::{Result, RunnerError};

/// Reads sources and buffers, persists outputs and IR.
pub trait RunnerIo {
    fn read_kernel_source(&mut self, path: &Path) -> Result<String>;

    fn read_buffer(&mut self, name: &str, path: &Path) -> Result<Vec<u8>>;

    fn write_buffer(&mut self, name: &str, path: &Path, data: &[u8]) -> Result<()>;

    fn write_ir(&mut self, path: &Path, ir: &str) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;
}

/// In-memory [`RunnerIo`], for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryIo {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: Vec<PathBuf>,
}

impl MemoryIo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn with_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dirs.push(path.into());
        self
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<&[u8]> {
        self.files.get(path.as_ref()).map(Vec::as_slice)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.files.keys().map(PathBuf::as_path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| {
            RunnerError::io(path, std::io::Error::from(std::io::ErrorKind::NotFound))
        })
    }
}

impl RunnerIo for MemoryIo {
    fn read_kernel_source(&mut self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes).map_err(|e| {
            RunnerError::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }

    fn read_buffer(&mut self, _name: &str, path: &Path) -> Result<Vec<u8>> {
        self.read(path)
    }

    fn write_buffer(&mut self, _name: &str, path: &Path, data: &[u8]) -> Result<()> {
        self.insert(path, data.to_vec());
        Ok(())
    }

    fn write_ir(&mut self, path: &Path, ir: &str) -> Result<()> {
        self.insert(path, ir.as_bytes().to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path) || self.is_dir(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.iter().any(|d| d == path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_io_round_trip() {
        let mut io = MemoryIo::new().with_file("k.cu", "__global__ void k() {}").with_dir("inc");
        assert!(io.exists(Path::new("k.cu")));
        assert!(io.is_dir(Path::new("inc")));
        assert!(!io.is_dir(Path::new("k.cu")));
        assert!(io.read_kernel_source(Path::new("k.cu")).unwrap().contains("__global__"));

        io.write_buffer("c", Path::new("c.out"), &[1, 2, 3]).unwrap();
        assert_eq!(io.file("c.out"), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let mut io = MemoryIo::new();
        let err = io.read_buffer("a", Path::new("a")).unwrap_err();
        assert!(matches!(err, RunnerError::Io { .. }));
    }
}

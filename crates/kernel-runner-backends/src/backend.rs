//! The backend contract shared by both GPU ecosystems.

use std::path::{Path, PathBuf};
use std::time::Duration;

use kernel_runner_common::{
    Ecosystem, LanguageStandard, PreprocessorDefinitions, ResolvedLaunchConfig, Result,
};
use tracing::{debug, error, Level};

use crate::arguments::{ArgumentConvention, MarshalledArguments};

/// Opaque reference to a device allocation owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(usize);

impl BufferHandle {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

/// Compiler switches common to both ecosystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompilationFlags {
    pub debug: bool,
    pub line_info: bool,
    pub language_standard: Option<LanguageStandard>,
}

/// Everything needed to build one kernel from source.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub source: &'a str,
    pub source_path: &'a Path,
    pub entry_point: &'a str,
    pub flags: CompilationFlags,
    pub include_paths: &'a [PathBuf],
    pub preinclude_files: &'a [PathBuf],
    pub definitions: &'a PreprocessorDefinitions,
}

/// Result of a successful build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOutput {
    /// Intermediate representation, when the toolchain produced text.
    pub ir: Option<String>,
    /// Compiler diagnostics, possibly empty.
    pub log: String,
}

/// Device selection made once at context construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSelection {
    pub ecosystem: Ecosystem,
    pub platform_id: Option<usize>,
    pub device_id: usize,
    /// The run will persist intermediate representation.
    pub need_ir: bool,
}

/// Build, memory and launch operations over one GPU ecosystem.
///
/// All device allocations are owned by the backend and addressed through
/// [`BufferHandle`]s. Operations enqueue on a single in-order stream or queue;
/// [`Backend::synchronize`] waits for everything enqueued so far.
pub trait Backend: Send {
    fn ecosystem(&self) -> Ecosystem;

    /// Human-readable device description for logs.
    fn device_description(&self) -> String;

    /// How this backend wants its argument list.
    fn argument_convention(&self) -> ArgumentConvention;

    /// Compile `request.source` and load `request.entry_point`.
    fn build(&mut self, request: &BuildRequest<'_>) -> Result<BuildOutput>;

    /// Allocate `size` bytes of device memory.
    fn allocate(&mut self, name: &str, size: usize) -> Result<BufferHandle>;

    fn buffer_size(&self, handle: BufferHandle) -> Result<usize>;

    fn copy_to_device(&mut self, handle: BufferHandle, data: &[u8]) -> Result<()>;

    /// Device-to-device copy of the whole of `src` into `dst` (equal sizes).
    fn copy_on_device(&mut self, dst: BufferHandle, src: BufferHandle) -> Result<()>;

    fn copy_to_host(&mut self, handle: BufferHandle, data: &mut [u8]) -> Result<()>;

    fn zero_fill(&mut self, handle: BufferHandle) -> Result<()>;

    /// Dispatch the built kernel; returns the device-measured time when `timed`.
    fn launch(
        &mut self,
        arguments: &MarshalledArguments,
        config: &ResolvedLaunchConfig,
        timed: bool,
    ) -> Result<Option<Duration>>;

    fn synchronize(&mut self) -> Result<()>;

    /// Unload the program and tear down the context. Further calls fail.
    fn release(&mut self) -> Result<()>;
}

/// Severity a compiler log is reported at, or `None` when there is nothing to say.
pub fn build_log_level(log: &str, succeeded: bool) -> Option<Level> {
    if !succeeded {
        Some(Level::ERROR)
    } else if log.trim().is_empty() {
        None
    } else {
        Some(Level::DEBUG)
    }
}

/// Surface a compiler log at the severity the build outcome calls for.
pub fn report_build_log(entry_point: &str, log: &str, succeeded: bool) {
    match build_log_level(log, succeeded) {
        Some(Level::ERROR) => {
            error!(kernel = %entry_point, "kernel build failed; compilation log:\n{log}")
        }
        Some(_) => debug!(kernel = %entry_point, "compilation log:\n{log}"),
        None => {}
    }
}

/// Split-borrow two distinct elements of a slice.
pub fn src_and_dst<T>(items: &mut [T], src: usize, dst: usize) -> Option<(&T, &mut T)> {
    if src == dst || src >= items.len() || dst >= items.len() {
        return None;
    }
    if src < dst {
        let (head, tail) = items.split_at_mut(dst);
        Some((&head[src], &mut tail[0]))
    } else {
        let (head, tail) = items.split_at_mut(src);
        Some((&tail[0], &mut head[dst]))
    }
}

//! The populated run options consumed by the orchestrator.
//!
//! The command-line front end fills a [`RunOptions`]; once handed to the
//! orchestrator it is never mutated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::ecosystem::Ecosystem;
use crate::error::{Result, RunnerError};
use crate::launch::LaunchConfigComponents;

/// Characters after the last of which a kernel key is clipped to form an identifier.
const KEY_SEPARATORS: &[char] = &['/', '-', ';', '.', '[', ']', '{', '}', '(', ')', ','];

/// C++ dialect for the CUDA runtime compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LanguageStandard {
    #[serde(rename = "c++11")]
    Cxx11,
    #[serde(rename = "c++14")]
    Cxx14,
    #[serde(rename = "c++17")]
    Cxx17,
}

impl LanguageStandard {
    /// The `--std=` flag understood by NVRTC.
    pub fn compiler_flag(self) -> String {
        format!("--std={self}")
    }
}

impl std::fmt::Display for LanguageStandard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cxx11 => write!(f, "c++11"),
            Self::Cxx14 => write!(f, "c++14"),
            Self::Cxx17 => write!(f, "c++17"),
        }
    }
}

impl std::str::FromStr for LanguageStandard {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c++11" | "cxx11" | "11" => Ok(Self::Cxx11),
            "c++14" | "cxx14" | "14" => Ok(Self::Cxx14),
            "c++17" | "cxx17" | "17" => Ok(Self::Cxx17),
            other => Err(format!("unsupported language standard: {other}")),
        }
    }
}

/// Whether `name` is a valid C identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// The part of `key` after its last separator character.
pub fn clip_key(key: &str) -> &str {
    match key.rfind(KEY_SEPARATORS) {
        Some(pos) => &key[pos + 1..],
        None => key,
    }
}

/// How the kernel to run is identified.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelIdentity {
    /// Adapter registry key.
    pub key: String,
    /// Entry point in the compiled program; the adapter supplies it when `None`.
    pub function_name: Option<String>,
    pub source_file: PathBuf,
}

impl KernelIdentity {
    /// Infer whichever of key, function name and source file were not given.
    pub fn resolve(
        key: Option<String>,
        function_name: Option<String>,
        source_file: Option<PathBuf>,
        sources_dir: &Path,
        ecosystem: Ecosystem,
    ) -> Result<Self> {
        if key.is_none() && function_name.is_none() && source_file.is_none() {
            return Err(RunnerError::configuration(
                "one of the kernel key, kernel function name or kernel source file must be specified",
            ));
        }

        let source_stem = source_file
            .as_deref()
            .and_then(Path::file_stem)
            .and_then(|s| s.to_str())
            .map(str::to_string);

        let mut function_name = function_name;
        if function_name.is_none() && key.is_none() {
            if let Some(stem) = source_stem.as_deref().filter(|s| is_valid_identifier(s)) {
                info!("inferring the kernel function name from the kernel source filename: '{stem}'");
                function_name = Some(stem.to_string());
            }
        }

        let key = match key {
            Some(key) => key,
            None => match (&source_stem, &function_name) {
                (Some(stem), _) => stem.clone(),
                (None, Some(name)) => {
                    info!("inferring the kernel key from the kernel function name: '{name}'");
                    name.clone()
                }
                (None, None) => {
                    return Err(RunnerError::configuration(
                        "cannot infer a kernel key without a source file or function name",
                    ));
                }
            },
        };
        debug!("using kernel key: {key}");

        let source_file = match source_file {
            Some(path) => path,
            None => {
                let base = function_name.as_deref().unwrap_or_else(|| clip_key(&key));
                PathBuf::from(format!("{base}.{}", ecosystem.source_suffix()))
            }
        };
        let source_file = prepend_base_dir(sources_dir, &source_file);
        debug!("resolved kernel source file path: {}", source_file.display());

        Ok(Self { key, function_name, source_file })
    }
}

/// Join `path` onto `base` unless it is already absolute.
pub fn prepend_base_dir(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() || base.as_os_str().is_empty() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Directories buffers are read from and written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferBasePaths {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl Default for BufferBasePaths {
    fn default() -> Self {
        Self { input: PathBuf::from("."), output: PathBuf::from(".") }
    }
}

/// Everything the orchestrator needs to know about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub ecosystem: Ecosystem,
    /// OpenCL platform index; meaningless for CUDA.
    pub platform_id: Option<usize>,
    pub device_id: usize,
    pub kernel: KernelIdentity,
    pub num_runs: u32,
    pub buffer_base_paths: BufferBasePaths,
    pub write_output_buffers_to_files: bool,
    pub overwrite_allowed: bool,
    pub zero_output_buffers: bool,
    pub time_with_events: bool,
    pub compile_only: bool,
    pub compile_in_debug_mode: bool,
    pub generate_line_info: bool,
    pub language_standard: Option<LanguageStandard>,
    pub write_ir: bool,
    pub ir_output_file: Option<PathBuf>,
    pub forced_launch_config: LaunchConfigComponents,
    /// Raw `-D` items.
    pub preprocessor_definitions: Vec<String>,
    /// Values given through kernel-specific options.
    pub preprocessor_value_definitions: BTreeMap<String, String>,
    pub include_dir_paths: Vec<PathBuf>,
    pub preinclude_files: Vec<PathBuf>,
    /// Explicitly named buffer files, by buffer name.
    pub buffer_filenames: BTreeMap<String, PathBuf>,
    /// Raw scalar argument strings, by parameter name.
    pub scalar_arguments: BTreeMap<String, String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            ecosystem: Ecosystem::Cuda,
            platform_id: None,
            device_id: 0,
            kernel: KernelIdentity::default(),
            num_runs: 1,
            buffer_base_paths: BufferBasePaths::default(),
            write_output_buffers_to_files: true,
            overwrite_allowed: false,
            zero_output_buffers: false,
            time_with_events: false,
            compile_only: false,
            compile_in_debug_mode: false,
            generate_line_info: true,
            language_standard: None,
            write_ir: false,
            ir_output_file: None,
            forced_launch_config: LaunchConfigComponents::default(),
            preprocessor_definitions: Vec::new(),
            preprocessor_value_definitions: BTreeMap::new(),
            include_dir_paths: Vec::new(),
            preinclude_files: Vec::new(),
            buffer_filenames: BTreeMap::new(),
            scalar_arguments: BTreeMap::new(),
        }
    }
}

impl RunOptions {
    /// Reject option combinations no run can satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.num_runs == 0 {
            return Err(RunnerError::configuration("number of runs must be a positive integer"));
        }
        if self.kernel.key.is_empty() {
            return Err(RunnerError::configuration("kernel key must not be empty"));
        }
        if let Some(name) = &self.kernel.function_name {
            if !is_valid_identifier(name) {
                return Err(RunnerError::configuration(format!(
                    "kernel function name `{name}` is not a valid identifier"
                )));
            }
        }
        if self.platform_id.is_some() && self.ecosystem != Ecosystem::OpenCl {
            return Err(RunnerError::configuration("a platform index is only meaningful for OpenCL"));
        }
        if self.language_standard.is_some() && self.ecosystem != Ecosystem::Cuda {
            return Err(RunnerError::configuration("a language standard can only be set for CUDA"));
        }
        let fc = &self.forced_launch_config;
        if fc.grid.is_some() && fc.overall.is_some() {
            return Err(RunnerError::AmbiguousLaunchConfig {
                reason: "both grid and overall dimensions were forced".into(),
            });
        }
        Ok(())
    }

    /// The entry point name, once the adapter's default has been applied.
    pub fn function_name(&self) -> &str {
        self.kernel.function_name.as_deref().unwrap_or(&self.kernel.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(is_valid_identifier("vector_add"));
        assert!(is_valid_identifier("_k2"));
        assert!(!is_valid_identifier("2k"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier(""));
    }

    #[test]
    fn clip_key_keeps_trailing_identifier() {
        assert_eq!(clip_key("blas/level1/saxpy"), "saxpy");
        assert_eq!(clip_key("reduce(int)"), "");
        assert_eq!(clip_key("plain"), "plain");
        assert_eq!(clip_key("ns.fill"), "fill");
    }

    #[test]
    fn identity_from_key_only() {
        let id = KernelIdentity::resolve(
            Some("blas/saxpy".into()),
            None,
            None,
            Path::new("kernels"),
            Ecosystem::Cuda,
        )
        .unwrap();
        assert_eq!(id.key, "blas/saxpy");
        assert_eq!(id.function_name, None);
        assert_eq!(id.source_file, PathBuf::from("kernels/saxpy.cu"));
    }

    #[test]
    fn identity_from_source_only() {
        let id = KernelIdentity::resolve(
            None,
            None,
            Some(PathBuf::from("/k/vector_add.cl")),
            Path::new("ignored"),
            Ecosystem::OpenCl,
        )
        .unwrap();
        assert_eq!(id.key, "vector_add");
        assert_eq!(id.function_name.as_deref(), Some("vector_add"));
        assert_eq!(id.source_file, PathBuf::from("/k/vector_add.cl"));
    }

    #[test]
    fn identity_from_function_name_only() {
        let id = KernelIdentity::resolve(
            None,
            Some("fill".into()),
            None,
            Path::new(""),
            Ecosystem::OpenCl,
        )
        .unwrap();
        assert_eq!(id.key, "fill");
        assert_eq!(id.source_file, PathBuf::from("fill.cl"));
    }

    #[test]
    fn identity_requires_something() {
        assert!(KernelIdentity::resolve(None, None, None, Path::new("."), Ecosystem::Cuda).is_err());
    }

    #[test]
    fn validate_rejects_zero_runs() {
        let opts = RunOptions {
            num_runs: 0,
            kernel: KernelIdentity { key: "k".into(), ..Default::default() },
            ..Default::default()
        };
        assert!(opts.validate().unwrap_err().to_string().contains("positive"));
    }

    #[test]
    fn validate_rejects_platform_for_cuda() {
        let opts = RunOptions {
            platform_id: Some(1),
            kernel: KernelIdentity { key: "k".into(), ..Default::default() },
            ..Default::default()
        };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn language_standard_parsing() {
        assert_eq!("c++14".parse::<LanguageStandard>().unwrap(), LanguageStandard::Cxx14);
        assert_eq!(LanguageStandard::Cxx17.compiler_flag(), "--std=c++17");
        assert!("c++20".parse::<LanguageStandard>().is_err());
    }
}

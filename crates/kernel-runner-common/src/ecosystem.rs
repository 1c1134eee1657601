//! The two mutually exclusive GPU execution ecosystems.

use serde::{Deserialize, Serialize};

/// GPU execution ecosystem selected once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Cuda,
    OpenCl,
}

impl Ecosystem {
    /// File suffix of kernel sources written for this ecosystem.
    pub fn source_suffix(self) -> &'static str {
        match self {
            Self::Cuda => "cu",
            Self::OpenCl => "cl",
        }
    }

    /// Extension of intermediate-representation files.
    ///
    /// OpenCL only emits textual IR on platforms that build through PTX, so
    /// both ecosystems share the extension.
    pub fn ir_extension(self) -> &'static str {
        match self {
            Self::Cuda | Self::OpenCl => "ptx",
        }
    }

    /// Cargo feature gating the backend implementation.
    pub fn feature_name(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::OpenCl => "opencl",
        }
    }

    /// Infer the ecosystem from a kernel source path's suffix.
    pub fn from_source_suffix(path: &std::path::Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "cu" | "cuh" => Some(Self::Cuda),
            "cl" => Some(Self::OpenCl),
            _ => None,
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::OpenCl => write!(f, "opencl"),
        }
    }
}

impl std::str::FromStr for Ecosystem {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "opencl" | "ocl" => Ok(Self::OpenCl),
            other => Err(format!("unknown GPU ecosystem: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parse_and_display_agree() {
        for eco in [Ecosystem::Cuda, Ecosystem::OpenCl] {
            assert_eq!(eco.to_string().parse::<Ecosystem>().unwrap(), eco);
        }
        assert_eq!("OpenCL".parse::<Ecosystem>().unwrap(), Ecosystem::OpenCl);
        assert!("vulkan".parse::<Ecosystem>().is_err());
    }

    #[test]
    fn suffixes() {
        assert_eq!(Ecosystem::Cuda.source_suffix(), "cu");
        assert_eq!(Ecosystem::OpenCl.source_suffix(), "cl");
        assert_eq!(Ecosystem::from_source_suffix(Path::new("k/add.cu")), Some(Ecosystem::Cuda));
        assert_eq!(Ecosystem::from_source_suffix(Path::new("add.cl")), Some(Ecosystem::OpenCl));
        assert_eq!(Ecosystem::from_source_suffix(Path::new("add.txt")), None);
        assert_eq!(Ecosystem::from_source_suffix(Path::new("add")), None);
    }
}

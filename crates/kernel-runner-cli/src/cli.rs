//! Command-line surface: generic options plus one option per kernel parameter.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use clap::{Arg, ArgMatches, Command, CommandFactory, FromArgMatches, Parser};
use kernel_runner_common::{
    pad_dims, BufferBasePaths, Ecosystem, KernelIdentity, LanguageStandard,
    LaunchConfigComponents, LogLevel, Result, RunOptions, RunnerConfig, RunnerError,
};
use kernel_runner_core::{AdapterRegistry, KernelAdapter, ParameterKind};
use tracing::{debug, warn};

use crate::logging::LogFormat;

const KERNEL_OPTIONS_HEADING: &str = "Kernel-specific options";

/// A runner for dynamically-compiled CUDA and OpenCL kernels.
#[derive(Debug, Parser)]
#[command(name = "kernel-runner", version)]
#[command(after_help = "Buffers, scalar arguments and preprocessor definitions of the chosen \
kernel are set with `--<name> <value>`; see the kernel-specific options below.")]
pub struct Cli {
    /// Configuration file with defaults for the generic options
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set logging level (trace, debug, info, warning, error, critical, off)
    #[arg(short = 'l', long, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Flush the log on every message at or above this level
    #[arg(long, value_name = "LEVEL")]
    pub log_flush_threshold: Option<LogLevel>,

    #[arg(long, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Write output buffers to files
    #[arg(short = 'w', long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub write_output: Option<bool>,

    /// Number of times to run the compiled kernel
    #[arg(short = 'n', long, value_name = "N")]
    pub num_runs: Option<u32>,

    /// Use OpenCL
    #[arg(long, conflicts_with = "cuda")]
    pub opencl: bool,

    /// Use CUDA
    #[arg(long)]
    pub cuda: bool,

    /// Use the OpenCL platform with the specified index
    #[arg(short = 'p', long, value_name = "INDEX")]
    pub platform_id: Option<usize>,

    /// Device index
    #[arg(short = 'd', long, value_name = "INDEX")]
    pub device: Option<usize>,

    /// Set a preprocessor definition: NAME or NAME=VALUE (repeatable)
    #[arg(short = 'D', long = "define", value_name = "DEFINITION")]
    pub defines: Vec<String>,

    /// Compile the kernel, but don't actually run it
    #[arg(short = 'c', long)]
    pub compile_only: bool,

    /// Compile the kernel in debug mode (no optimizations)
    #[arg(short = 'G', long)]
    pub debug_mode: bool,

    /// Write the intermediate representation (PTX) resulting from the compilation
    #[arg(short = 'P', long)]
    pub write_ptx: bool,

    /// File to which to write the kernel's intermediate representation
    #[arg(long, value_name = "PATH")]
    pub ptx_output_file: Option<PathBuf>,

    /// Add source line information to the intermediate representation
    #[arg(long, value_name = "BOOL", num_args = 0..=1, default_missing_value = "true")]
    pub generate_line_info: Option<bool>,

    /// Block dimensions in threads (OpenCL: local work size); comma-separated
    #[arg(short = 'b', long, value_name = "DIMS", value_delimiter = ',')]
    pub block_dimensions: Option<Vec<u32>>,

    /// Grid dimensions in blocks; comma-separated
    #[arg(short = 'g', long, value_name = "DIMS", value_delimiter = ',')]
    pub grid_dimensions: Option<Vec<u32>>,

    /// Grid dimensions in threads (OpenCL: global work size); comma-separated
    #[arg(short = 'o', long, value_name = "DIMS", value_delimiter = ',')]
    pub overall_grid_dimensions: Option<Vec<u32>>,

    /// Force a specific amount of dynamic shared memory, in bytes
    #[arg(short = 'S', long, value_name = "BYTES")]
    pub dynamic_shared_memory_size: Option<u32>,

    /// Overwrite existing buffer and IR output files
    #[arg(short = 'W', long)]
    pub overwrite_allowed: bool,

    /// Include a specific file into the kernel's translation unit (repeatable)
    #[arg(short = 'i', long = "include", value_name = "FILE")]
    pub preinclude_files: Vec<PathBuf>,

    /// Add a directory to the header search path (repeatable)
    #[arg(short = 'I', long = "include-path", value_name = "DIR")]
    pub include_paths: Vec<PathBuf>,

    /// Kernel source file; absolute or relative to the sources directory
    #[arg(short = 's', long, value_name = "PATH")]
    pub kernel_source: Option<PathBuf>,

    /// Name of the kernel function, if different from the key
    #[arg(short = 'k', long, value_name = "NAME")]
    pub kernel_function: Option<String>,

    /// The key identifying the kernel among the registered kernels
    #[arg(short = 'K', long, value_name = "KEY")]
    pub kernel_key: Option<String>,

    /// List the keys of the kernels this program can run
    #[arg(short = 'L', long)]
    pub list_kernels: bool,

    /// Set the contents of output(-only) buffers to all-zeros before each run
    #[arg(short = 'z', long)]
    pub zero_output_buffers: bool,

    /// Time each run with CUDA events or OpenCL profiling
    #[arg(short = 't', long)]
    pub time_execution: bool,

    /// Language standard for CUDA compilation (c++11, c++14, c++17)
    #[arg(long, value_name = "STD")]
    pub language_standard: Option<LanguageStandard>,

    /// Base location for input buffers
    #[arg(long, value_name = "DIR")]
    pub input_buffer_dir: Option<PathBuf>,

    /// Base location for output buffers
    #[arg(long, value_name = "DIR")]
    pub output_buffer_dir: Option<PathBuf>,

    /// Base location for kernel source files
    #[arg(long, value_name = "DIR")]
    pub kernel_sources_dir: Option<PathBuf>,
}

fn kernel_option_id(name: &str) -> String {
    format!("kernel-option:{name}")
}

/// The full command: generic options plus every registered kernel's options.
///
/// All kernel-specific options take one string value; the selected kernel
/// decides what the value means.
pub fn command(registry: &AdapterRegistry) -> Result<Command> {
    let mut cmd = Cli::command();
    let generic: BTreeSet<String> = cmd
        .get_arguments()
        .filter_map(|arg| arg.get_long())
        .chain(["help", "version"])
        .map(str::to_string)
        .collect();

    let mut uses: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    for key in registry.keys() {
        let adapter = registry.produce(key)?;
        for param in adapter.parameter_details() {
            let what = match param.kind {
                ParameterKind::Buffer => format!("{} buffer file", param.direction),
                ParameterKind::Scalar(kind) => format!("{kind} scalar"),
            };
            uses.entry(param.name)
                .or_default()
                .push(format!("{key}: {} ({what})", param.description));
        }
        for def in adapter.preprocessor_definition_details() {
            uses.entry(def.name)
                .or_default()
                .push(format!("{key}: {} (preprocessor definition)", def.description));
        }
    }

    for (name, descriptions) in uses {
        if generic.contains(name) {
            return Err(RunnerError::configuration(format!(
                "kernel option `--{name}` collides with a generic option of the same name"
            )));
        }
        cmd = cmd.arg(
            Arg::new(kernel_option_id(name))
                .long(name)
                .value_name("VALUE")
                .help(descriptions.join("; "))
                .help_heading(KERNEL_OPTIONS_HEADING),
        );
    }
    Ok(cmd)
}

/// Parsed generic options and the raw matches they came from.
#[derive(Debug)]
pub struct Invocation {
    pub cli: Cli,
    pub matches: ArgMatches,
}

impl Invocation {
    pub fn from_matches(matches: ArgMatches) -> std::result::Result<Self, clap::Error> {
        let cli = Cli::from_arg_matches(&matches)?;
        Ok(Self { cli, matches })
    }

    fn kernel_option(&self, name: &str) -> Option<&String> {
        self.matches.try_get_one::<String>(&kernel_option_id(name)).ok().flatten()
    }

    fn given_kernel_options(&self) -> Vec<&str> {
        self.matches
            .ids()
            .filter_map(|id| id.as_str().strip_prefix("kernel-option:"))
            .filter(|name| self.kernel_option(name).is_some())
            .collect()
    }

    pub fn ecosystem(&self, config: &RunnerConfig) -> Ecosystem {
        if self.cli.opencl {
            Ecosystem::OpenCl
        } else if self.cli.cuda {
            Ecosystem::Cuda
        } else {
            config.ecosystem.unwrap_or(Ecosystem::Cuda)
        }
    }

    pub fn log_level(&self, config: &RunnerConfig) -> LogLevel {
        self.cli.log_level.unwrap_or(config.log_level)
    }

    pub fn log_flush_threshold(&self, config: &RunnerConfig) -> LogLevel {
        self.cli.log_flush_threshold.unwrap_or(config.log_flush_threshold)
    }

    /// Populate the run options; command-line values win over `config`.
    pub fn run_options(
        &self,
        config: &RunnerConfig,
        registry: &AdapterRegistry,
    ) -> Result<RunOptions> {
        let cli = &self.cli;
        let ecosystem = self.ecosystem(config);
        let sources_dir = cli
            .kernel_sources_dir
            .clone()
            .unwrap_or_else(|| config.kernel_sources_dir.clone());
        let kernel = KernelIdentity::resolve(
            cli.kernel_key.clone(),
            cli.kernel_function.clone(),
            cli.kernel_source.clone(),
            &sources_dir,
            ecosystem,
        )?;
        let adapter = registry.produce(&kernel.key)?;

        let mut include_dir_paths = config.include_paths.clone();
        include_dir_paths.extend(cli.include_paths.iter().cloned());
        let mut preprocessor_definitions = config.defines.clone();
        preprocessor_definitions.extend(cli.defines.iter().cloned());

        let mut options = RunOptions {
            ecosystem,
            platform_id: cli.platform_id.or(config.platform),
            device_id: cli.device.unwrap_or(config.device),
            kernel,
            num_runs: cli.num_runs.unwrap_or(config.num_runs),
            buffer_base_paths: BufferBasePaths {
                input: cli
                    .input_buffer_dir
                    .clone()
                    .unwrap_or_else(|| config.input_buffer_dir.clone()),
                output: cli
                    .output_buffer_dir
                    .clone()
                    .unwrap_or_else(|| config.output_buffer_dir.clone()),
            },
            write_output_buffers_to_files: cli.write_output.unwrap_or(config.write_output),
            overwrite_allowed: cli.overwrite_allowed || config.overwrite_allowed,
            zero_output_buffers: cli.zero_output_buffers || config.zero_output_buffers,
            time_with_events: cli.time_execution || config.time_execution,
            compile_only: cli.compile_only,
            compile_in_debug_mode: cli.debug_mode,
            generate_line_info: cli.generate_line_info.unwrap_or(config.generate_line_info),
            language_standard: cli.language_standard.or(config.language_standard),
            write_ir: cli.write_ptx,
            ir_output_file: cli.ptx_output_file.clone(),
            forced_launch_config: self.forced_launch_config()?,
            preprocessor_definitions,
            include_dir_paths,
            preinclude_files: cli.preinclude_files.clone(),
            ..RunOptions::default()
        };
        if options.ecosystem != Ecosystem::Cuda
            && options.language_standard.is_some()
            && cli.language_standard.is_none()
        {
            debug!("ignoring the configured language standard, which only applies to CUDA");
            options.language_standard = None;
        }
        if options.ecosystem != Ecosystem::OpenCl && cli.platform_id.is_none() {
            options.platform_id = None;
        }
        if cli.ptx_output_file.is_some() && !cli.write_ptx {
            warn!("an IR output file was given without --write-ptx; no IR will be written");
        }

        self.apply_kernel_options(&*adapter, &mut options);
        options.validate()?;
        Ok(options)
    }

    fn forced_launch_config(&self) -> Result<LaunchConfigComponents> {
        let dims = |given: &Option<Vec<u32>>| given.as_deref().map(pad_dims).transpose();
        LaunchConfigComponents::forced(
            dims(&self.cli.block_dimensions)?,
            dims(&self.cli.grid_dimensions)?,
            dims(&self.cli.overall_grid_dimensions)?,
            self.cli.dynamic_shared_memory_size,
        )
    }

    fn apply_kernel_options(&self, adapter: &dyn KernelAdapter, options: &mut RunOptions) {
        for name in self.given_kernel_options() {
            let Some(value) = self.kernel_option(name) else {
                continue;
            };
            if let Some(param) = adapter.find_parameter(name) {
                if param.is_buffer() {
                    options.buffer_filenames.insert(name.to_string(), PathBuf::from(value));
                } else {
                    options.scalar_arguments.insert(name.to_string(), value.clone());
                }
            } else if adapter.preprocessor_definition_details().iter().any(|d| d.name == name) {
                options.preprocessor_value_definitions.insert(name.to_string(), value.clone());
            } else {
                warn!("option --{name} does not apply to kernel {}; ignoring it", adapter.key());
            }
        }
    }
}

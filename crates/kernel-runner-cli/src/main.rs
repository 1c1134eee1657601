use std::process;

use anyhow::{Context, Result};
use kernel_runner_adapters::builtin_registry;
use kernel_runner_cli::cli::{self, Invocation};
use kernel_runner_cli::exit;
use kernel_runner_cli::fs_io::FsIo;
use kernel_runner_cli::logging;
use kernel_runner_common::RunnerConfig;
use kernel_runner_core::{AdapterRegistry, Orchestrator, RunOutcome};
use tracing::{debug, error, info};

fn main() {
    if let Err(e) = run() {
        error!("{e}");
        for cause in e.chain().skip(1) {
            error!("  caused by: {cause}");
        }
        eprintln!("Error: {e:#}");
        process::exit(exit::for_error(&e));
    }
}

fn run() -> Result<()> {
    let registry = builtin_registry()?;
    let matches = match cli::command(&registry)?.try_get_matches() {
        Ok(matches) => matches,
        Err(e) => e.exit(),
    };
    let invocation = match Invocation::from_matches(matches) {
        Ok(invocation) => invocation,
        Err(e) => e.exit(),
    };

    let config = match &invocation.cli.config {
        Some(path) => RunnerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => RunnerConfig::from_env()?,
    };
    logging::init(
        invocation.log_level(&config),
        invocation.log_flush_threshold(&config),
        invocation.cli.log_format,
    )?;
    debug!(?config, "configuration loaded");

    if invocation.cli.list_kernels {
        list_kernels(&registry);
        return Ok(());
    }

    let options = invocation.run_options(&config, &registry)?;
    let mut io = FsIo;
    let outcome = Orchestrator::new(&registry, &mut io).run(options)?;
    match outcome {
        RunOutcome::CompiledOnly { ir_written } => {
            info!("compilation succeeded");
            if let Some(path) = ir_written {
                info!("intermediate representation written to {}", path.display());
            }
        }
        RunOutcome::Completed(report) => {
            info!("completed {} run(s) with launch configuration {}", report.runs, report.launch_config);
            if !report.timings.is_empty() {
                let total: std::time::Duration = report.timings.iter().sum();
                info!(
                    "mean kernel execution time: {:.3} ms",
                    total.as_secs_f64() * 1e3 / report.timings.len() as f64
                );
            }
            for path in &report.outputs_written {
                debug!("wrote {}", path.display());
            }
        }
    }
    Ok(())
}

fn list_kernels(registry: &AdapterRegistry) {
    for key in registry.keys() {
        println!("{key}");
    }
}

//! Command-line driver: instruments a serialized module for fuzzing.
//!
//! The build is configured through the `AFL_*` environment variables, like
//! the compiler wrappers that invoke it. Artifacts go to the paths named by
//! the `AFL_BCCLANG_*` variables unless `--artifacts-dir` is given.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use bcfuzz::config::Config;
use bcfuzz::coordinator::{OutputPaths, Pipeline};
use bcfuzz::ir::Module;
use bcfuzz::log::stderr_logger;
use clap::Parser;
use slog::{Logger, crit, info};

#[derive(Parser, Debug)]
#[command(
    name = "bcfuzz-instrument",
    version,
    about = "Adds edge coverage, comparison splitting and a dictionary to a module"
)]
struct Cli {
    /// Module to instrument, as JSON.
    input: PathBuf,

    /// Where to write the instrumented module.
    #[arg(short, long)]
    output: PathBuf,

    /// Write the artifacts to this directory instead of the AFL_BCCLANG_* paths.
    #[arg(long)]
    artifacts_dir: Option<PathBuf>,

    /// Seed for identifier draws, for reproducible builds.
    #[arg(long)]
    seed: Option<u64>,

    /// Also print debug records.
    #[arg(short, long)]
    verbose: bool,
}

fn run(cli: &Cli, config: &Config, log: &Logger) -> Result<()> {
    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("Cannot read {}", cli.input.display()))?;
    let mut module: Module = serde_json::from_str(&text)
        .with_context(|| format!("Cannot parse module {}", cli.input.display()))?;

    let paths = match &cli.artifacts_dir {
        Some(dir) => OutputPaths::in_dir(dir, config.build_type),
        None => OutputPaths::from_env(config.build_type)?,
    };

    let artifacts = Pipeline::new(config, log.clone()).run(&mut module)?;
    artifacts.write(&paths, log)?;

    let json = serde_json::to_string_pretty(&module).context("Cannot serialize module")?;
    fs::write(&cli.output, json)
        .with_context(|| format!("Cannot write {}", cli.output.display()))?;
    info!(log, "Wrote {}", cli.output.display();
        "map_size" => artifacts.map_size,
        "build_id" => format!("{:016x}", artifacts.build_id),
    );
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let quiet = env::var_os("AFL_QUIET").is_some();
    let log = stderr_logger(quiet, cli.verbose);

    let config = match Config::from_env() {
        Ok(config) => Config {
            seed: cli.seed.or(config.seed),
            ..config
        },
        Err(e) => {
            crit!(log, "{}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, &config, &log) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            crit!(log, "{:#}", e);
            ExitCode::FAILURE
        }
    }
}

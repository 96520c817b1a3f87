// Copyright (c) The wptrep Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr};
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    time::Duration,
};
use tracing::warn;
use wptrep::{
    config::ProcessorConfig,
    early_exit::Threshold,
    events::Event,
    manifest::TestManifest,
    processor::StreamProcessor,
    report::{summarize, write_reports},
};

/// Exit code for a run with at least one regression.
const REGRESSED_EXIT_CODE: i32 = 100;

/// Replay wptrunner structured logs into layout-test result reports.
#[derive(Debug, Parser)]
#[command(name = "wptrep", version, about)]
pub struct WptrepApp {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging.
    #[arg(long, global = true)]
    verbose: bool,
}

impl WptrepApp {
    /// Runs the selected command, returning the process exit code.
    pub fn exec(self) -> Result<i32> {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(io::stderr)
            .init();
        match self.command {
            Command::Process(args) => process(args),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process a recorded event stream into results and artifacts.
    Process(ProcessArgs),
}

#[derive(Debug, Args)]
struct ProcessArgs {
    /// Structured-log file of JSON lines, or `-` for stdin.
    #[arg(long, value_name = "PATH")]
    events: String,

    /// Directory to write artifacts and reports under.
    #[arg(long, value_name = "DIR")]
    output_dir: Utf8PathBuf,

    /// Test manifest used to locate checked-in expectation files.
    #[arg(long, value_name = "PATH")]
    manifest: Option<Utf8PathBuf>,

    /// Root directory of checked-in expectation metadata.
    #[arg(long, value_name = "DIR")]
    metadata_dir: Option<Utf8PathBuf>,

    /// Terminate the run after this many unexpected failures.
    #[arg(long, value_name = "N")]
    failure_threshold: Option<usize>,

    /// Terminate the run after this many unexpected crashes or timeouts.
    #[arg(long, value_name = "N")]
    crash_timeout_threshold: Option<usize>,

    /// Flag attempts at least this many seconds long as slow tests.
    #[arg(long, value_name = "SECS")]
    slow_test_threshold: Option<u64>,

    /// How long to wait for the processor to drain its queue.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    shutdown_timeout: u64,
}

fn process(args: ProcessArgs) -> Result<i32> {
    let manifest = args
        .manifest
        .as_deref()
        .map(TestManifest::load)
        .transpose()
        .wrap_err("failed to load test manifest")?;

    let mut config = ProcessorConfig::new(args.output_dir.clone());
    config.failure_threshold = Threshold::from_count(args.failure_threshold);
    config.crash_timeout_threshold = Threshold::from_count(args.crash_timeout_threshold);
    config.slow_test_threshold = args.slow_test_threshold.map(Duration::from_secs);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .wrap_err("failed to start async runtime")?;

    runtime.block_on(async move {
        let mut processor = StreamProcessor::new(config);
        if let Some(manifest) = manifest {
            processor = processor.with_manifest(manifest);
        }
        if let Some(root) = args.metadata_dir {
            processor = processor.with_metadata_root(root);
        }
        let (sender, handle) = processor.spawn();

        let reader: Box<dyn BufRead> = if args.events == "-" {
            Box::new(BufReader::new(io::stdin()))
        } else {
            let file = File::open(&args.events)
                .wrap_err_with(|| format!("failed to open events file `{}`", args.events))?;
            Box::new(BufReader::new(file))
        };
        for (index, line) in reader.lines().enumerate() {
            let line = line.wrap_err("failed to read events")?;
            if line.trim().is_empty() {
                continue;
            }
            match Event::from_json_line(&line) {
                Ok(event) => {
                    if sender.send(event).is_err() {
                        // The consumer is gone; the join below will explain.
                        break;
                    }
                }
                Err(error) => {
                    warn!(line = index + 1, %error, "skipping malformed event line");
                }
            }
        }

        let outcome = handle
            .shutdown(Duration::from_secs(args.shutdown_timeout))
            .await?;
        let summary = summarize(&outcome.results_by_name, outcome.interrupted);
        write_reports(&args.output_dir, &summary)?;

        println!(
            "{} tests: {} passed, {} regressed{}",
            outcome.results_by_name.len(),
            summary.num_passes,
            summary.num_regressions,
            if outcome.interrupted {
                " (interrupted)"
            } else {
                ""
            },
        );
        Ok(if summary.num_regressions > 0 {
            REGRESSED_EXIT_CODE
        } else {
            0
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn clap_definition_is_valid() {
        WptrepApp::command().debug_assert();
    }
}

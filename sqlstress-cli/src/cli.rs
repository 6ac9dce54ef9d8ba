//! Command line interface and process lifecycle.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use sqlstress_engine::{Connect, PrintConnect, Progress, Task};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::{observability, progress};

/// Exit code after an interrupted run, following shell convention for
/// termination by SIGINT.
const EXIT_INTERRUPTED: u8 = 130;

/// SQL load generation tool.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Version(VersionCommand),
}

/// run the benchmark against the configured target
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {}

/// print the sqlstress version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> ExitCode {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    match try_execute(args) {
        Ok(code) => code,
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn try_execute(args: Args) -> Result<ExitCode> {
    // Tracing first, so configuration errors are reported through it.
    observability::init_tracing();

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;
    tracing::debug!(?config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("main-rt")
        .enable_all()
        .build()?;
    let _runtime_guard = runtime.enter();

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<ExitCode> {
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
            interrupt.cancel();
        }
    });

    let options = config.task_options();
    let connector: Arc<dyn Connect> = if options.only_print {
        Arc::new(PrintConnect)
    } else {
        bail!(
            "no SQL driver is wired up; set `target.only_print: true` or \
             provide your own `Connect` implementation through the engine API"
        );
    };

    // The spinner would mangle the statements printed in print-only mode.
    let on_progress: Box<dyn FnMut(Progress) + Send> = if options.only_print {
        Box::new(|_| {})
    } else {
        Box::new(progress::renderer()?)
    };

    let mut task = Task::new(options, config.workload.clone(), connector);

    task.prepare(&cancel)
        .await
        .context("failed to prepare benchmark")?;
    if cancel.is_cancelled() {
        teardown(&mut task).await;
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }

    let result = task.run(&cancel, on_progress).await;
    teardown(&mut task).await;

    match result {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if cancel.is_cancelled() {
                Ok(ExitCode::from(EXIT_INTERRUPTED))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        // An interrupt can race agent shutdown; the interrupt wins.
        Err(_) if cancel.is_cancelled() => Ok(ExitCode::from(EXIT_INTERRUPTED)),
        Err(error) => Err(error),
    }
}

async fn teardown(task: &mut Task) {
    if let Err(error) = task.close().await {
        tracing::warn!("failed to tear down benchmark database: {error:#}");
    }
}

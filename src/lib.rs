// src/lib.rs

pub mod checkpoint;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod errors;
pub mod executioner;
pub mod fs;
pub mod logging;
pub mod monitor;
pub mod pipeline;
pub mod task;
pub mod types;
pub mod wrapper;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::{debug, info};

use crate::cli::{CliArgs, Command, RunArgs};
use crate::config::load_and_validate;
use crate::fs::RealFileSystem;
use crate::monitor::{MessageQueue, SpoolQueue};
use crate::pipeline::{print_dry_run, Context, Pipeline};

/// High-level entry point used by `main.rs`. Returns the process exit
/// status.
///
/// `run` wires together:
/// - config loading and validation
/// - the pipeline driver and its executioners
/// - checkpoint resume
/// - Ctrl-C handling
///
/// The other subcommands are the process-side wrappers executioners launch.
pub async fn run(args: CliArgs) -> Result<i32> {
    match args.command {
        Command::Run(run) => run_pipeline(run).await,
        Command::Exec(exec) => Ok(wrapper::exec_wrapper(&exec).await?),
        Command::Kill { pids } => {
            wrapper::kill_pids(&pids).await?;
            Ok(0)
        }
        Command::TaskExec {
            checkpoint,
            queue,
            heartbeat_secs,
        } => {
            let queue: Arc<dyn MessageQueue> = Arc::new(
                SpoolQueue::open(&queue)
                    .with_context(|| format!("opening queue {}", queue.display()))?,
            );
            let heartbeat = Duration::from_secs(heartbeat_secs.max(1));
            Ok(wrapper::task_exec(&checkpoint, queue, heartbeat).await?)
        }
    }
}

async fn run_pipeline(args: RunArgs) -> Result<i32> {
    let config = load_and_validate(&args.config, args.system)
        .with_context(|| format!("loading pipeline file {}", args.config.display()))?;

    if args.dry_run {
        print_dry_run(&config);
        debug!("dry-run complete (no execution)");
        return Ok(0);
    }

    let ctx = Context::new(config, Arc::new(RealFileSystem));
    let pipeline = match &args.resume {
        Some(checkpoint) => {
            info!(checkpoint = %checkpoint.display(), "resuming from checkpoint");
            Pipeline::resume(ctx, checkpoint).await?
        }
        None => Pipeline::new(ctx),
    };
    let mut pipeline = pipeline.with_source(&args.config);

    let outcome = tokio::select! {
        result = pipeline.run() => Some(result),
        _ = wrapper::ctrl_c() => None,
    };

    match outcome {
        Some(Ok(report)) => {
            print!("{report}");
            Ok(0)
        }
        // Already printed with the failing task's details.
        Some(Err(err)) => {
            debug!(error = %err, "pipeline aborted");
            Ok(1)
        }
        None => {
            pipeline.interrupt().await;
            Ok(130)
        }
    }
}

// src/pipeline/mod.rs

//! Pipeline driver.
//!
//! Walks the `[[task]]` declarations in order, the way an interpreter would
//! walk task statements: each declaration is turned into a [`Task`], checked
//! for staleness and submitted to the executioner of its system without
//! waiting for it. `wait = true` declarations and the end of the file
//! suspend until every registered task is terminal.
//!
//! A fatal failure kills what is still running, prints the failing task
//! and, if enabled, writes a checkpoint that `run --resume` picks up.

pub mod context;
pub mod report;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, InterpreterState, RecoveryPlan};
use crate::config::TaskDecl;
use crate::errors::{PipelineError, Result};
use crate::task::{Resources, Task, TaskDependency, TaskFlags, TaskId};

pub use context::Context;
pub use report::{fatal_message, PipelineReport, TaskSummary};

pub struct Pipeline {
    ctx: Context,
    pipeline_file: Option<PathBuf>,
    next_declaration: usize,
    /// Non-fatal failures already logged.
    reported: HashSet<TaskId>,
}

impl Pipeline {
    pub fn new(ctx: Context) -> Self {
        Self {
            ctx,
            pipeline_file: None,
            next_declaration: 0,
            reported: HashSet::new(),
        }
    }

    /// Remember which file the declarations came from (stored in
    /// checkpoints).
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.pipeline_file = Some(path.into());
        self
    }

    /// Restore a checkpoint: finished tasks stay finished, running tasks are
    /// re-attached and the rest are submitted again. The declaration walk
    /// continues where the checkpointed run stopped.
    pub async fn resume(ctx: Context, checkpoint: &Path) -> Result<Self> {
        let plan = RecoveryPlan::from_checkpoint(Checkpoint::load(ctx.fs.as_ref(), checkpoint)?);
        plan.restore_into(&ctx.registry);

        for r in &plan.reattach {
            ctx.executioner(r.system)?
                .reattach(&r.task_id, &r.backend_id)
                .await?;
        }
        for id in &plan.resubmit {
            let Some(task) = ctx.registry.get(id) else {
                continue;
            };
            info!(task = %id, "resubmitting task from checkpoint");
            ctx.executioner(task.system)?.submit(id).await?;
        }

        let pipeline_file = plan.interpreter.pipeline_file.clone();
        Ok(Self {
            ctx,
            pipeline_file,
            next_declaration: plan.interpreter.next_declaration,
            reported: HashSet::new(),
        })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Run the remaining declarations and wait for every task.
    pub async fn run(&mut self) -> Result<PipelineReport> {
        let outcome = match self.run_declarations().await {
            Ok(()) => self.wait_all().await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => {
                self.ctx.shutdown(true).await;
                let report = self.report();
                info!(tasks = report.tasks.len(), failures = report.failures.len(), "pipeline finished");
                Ok(report)
            }
            Err(err) => {
                self.on_fatal(&err).await;
                Err(err)
            }
        }
    }

    async fn run_declarations(&mut self) -> Result<()> {
        while let Some(decl) = self.ctx.config.tasks.get(self.next_declaration).cloned() {
            if decl.wait {
                debug!(task = %decl.id, "waiting for earlier tasks");
                self.wait_all().await?;
            }
            self.declare(&decl).await?;
            self.next_declaration += 1;
        }
        Ok(())
    }

    /// Register and submit one declaration.
    ///
    /// Returns `None` when nothing was submitted: the id is already
    /// registered (resumed run) or the declared outputs are up to date.
    pub async fn declare(&mut self, decl: &TaskDecl) -> Result<Option<TaskId>> {
        let registry = &self.ctx.registry;
        if registry.contains(&decl.id) {
            debug!(task = %decl.id, "task already registered");
            return Ok(None);
        }

        let mut dependency = TaskDependency::default();
        for input in &decl.inputs {
            dependency.add_input(input, registry);
        }
        for output in &decl.outputs {
            dependency.add_output(output, registry)?;
        }
        for after in &decl.after {
            dependency.add_task(after);
        }
        // A file input still being written by an earlier task makes that
        // task a prerequisite, so the consumer starts after it.
        for input in dependency.inputs.clone() {
            for (producer, state) in registry.producers_of(&input) {
                if !state.is_terminal() {
                    debug!(task = %decl.id, %producer, input = %input.display(), "waiting on producer");
                    dependency.add_task(&producer);
                }
            }
        }

        // Plain tasks with no declared I/O always run.
        let must_run = !decl.has_io() || dependency.is_stale(self.ctx.fs.as_ref(), registry)?;

        let system = self.ctx.config.system_for(decl);
        let mut task = Task::new(decl.id.clone(), decl.cmd.clone(), self.ctx.config.work_dir())
            .with_system(system)
            .with_timeout(decl.timeout())
            .with_stdin(decl.stdin.clone())
            .with_resources(Resources::from(decl.resources.clone()))
            .with_flags(TaskFlags {
                can_fail: decl.can_fail,
                allow_empty_output: decl.allow_empty_output,
                detached: decl.detached,
            })
            .with_dependency(dependency);

        if !must_run {
            info!(task = %decl.id, "outputs up to date, skipping");
            task.mark_up_to_date()?;
            registry.add(task)?;
            return Ok(None);
        }

        registry.add(task)?;
        self.ctx.executioner(system)?.submit(&decl.id).await?;
        Ok(Some(decl.id.clone()))
    }

    /// Suspend until every registered task is terminal.
    ///
    /// Fails with the first fatal task failure; non-fatal ones are logged
    /// once and end up in the report.
    pub async fn wait_all(&mut self) -> Result<()> {
        let mut changes = self.ctx.registry.subscribe();
        loop {
            changes.borrow_and_update();
            self.check_failures()?;
            if self.ctx.registry.pending().is_empty() {
                return Ok(());
            }
            if changes.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    fn check_failures(&mut self) -> Result<()> {
        let fs = self.ctx.fs.clone();
        for id in self.ctx.registry.ids() {
            if self.reported.contains(&id) {
                continue;
            }
            // Reading a failure only fills the output-check memo.
            let found = self
                .ctx
                .registry
                .update_silently(&id, |t| t.failure(fs.as_ref()).map(|e| (e, t.flags.can_fail)))?;
            let Some((err, can_fail)) = found else {
                continue;
            };
            if err.is_fatal_for_pipeline(can_fail) {
                return Err(err);
            }
            warn!(task = %id, error = %err, "task failed; continuing");
            self.reported.insert(id);
        }
        Ok(())
    }

    pub fn report(&self) -> PipelineReport {
        PipelineReport::from_registry(&self.ctx.registry, self.ctx.fs.as_ref())
    }

    /// Capture the current state without stopping anything.
    pub fn checkpoint(&self, reason: impl Into<String>) -> Checkpoint {
        Checkpoint::capture(
            &self.ctx.registry,
            InterpreterState {
                pipeline_file: self.pipeline_file.clone(),
                next_declaration: self.next_declaration,
            },
            reason,
        )
    }

    async fn on_fatal(&mut self, err: &PipelineError) {
        error!(error = %err, "fatal pipeline error");
        self.stop_all().await;

        let task = err.task_id().and_then(|id| self.ctx.registry.get(id));
        eprint!("{}", fatal_message(err, task.as_ref(), self.ctx.fs.as_ref()));
        self.save_checkpoint(&err.to_string());
    }

    /// Stop after an external interrupt (Ctrl-C): kill what is running and
    /// checkpoint like a fatal error would.
    pub async fn interrupt(&mut self) {
        warn!("interrupted; stopping tasks");
        self.stop_all().await;
        self.save_checkpoint("interrupted");
    }

    async fn stop_all(&self) {
        for id in self.ctx.registry.pending() {
            if let Some(task) = self.ctx.registry.get(&id) {
                if let Ok(executioner) = self.ctx.executioner(task.system) {
                    if let Err(e) = executioner.kill(&id).await {
                        warn!(task = %id, error = %e, "kill failed");
                    }
                }
            }
        }
        self.ctx.shutdown(false).await;
    }

    fn save_checkpoint(&self, reason: &str) {
        if !self.ctx.config.config.checkpoint_on_fatal {
            return;
        }
        let path = self.ctx.config.checkpoint_path();
        match self.checkpoint(reason).save(self.ctx.fs.as_ref(), &path) {
            Ok(()) => eprintln!("Checkpoint written to '{}'", path.display()),
            // Never mask the original error.
            Err(e) => error!(error = %e, "could not write checkpoint"),
        }
    }
}

/// Print what `run --dry-run` would do.
pub fn print_dry_run(config: &crate::config::PipelineFile) {
    println!("pipeworks dry-run");
    println!("  config.system = {}", config.config.system);
    println!("  config.work_dir = {}", config.work_dir().display());
    println!();
    println!("tasks ({}):", config.tasks.len());
    for decl in &config.tasks {
        println!("  - {} [{}]", decl.id, config.system_for(decl));
        println!("      cmd: {}", decl.cmd.trim_end());
        if !decl.inputs.is_empty() {
            println!("      inputs: {:?}", decl.inputs);
        }
        if !decl.outputs.is_empty() {
            println!("      outputs: {:?}", decl.outputs);
        }
        if !decl.after.is_empty() {
            println!("      after: {:?}", decl.after);
        }
        if let Some(timeout) = &decl.timeout {
            println!("      timeout: {timeout}");
        }
        if decl.can_fail {
            println!("      can_fail: true");
        }
        if decl.detached {
            println!("      detached: true");
        }
        if decl.wait {
            println!("      wait: true");
        }
    }
}

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pipeworks::checkpoint::{Checkpoint, InterpreterState, RecoveryPlan};
use pipeworks::config::{LocalSection, RuntimeSettings};
use pipeworks::errors::PipelineError;
use pipeworks::executioner::{Executioner, LocalBackend};
use pipeworks::fs::RealFileSystem;
use pipeworks::task::{Task, TaskRegistry, TaskState};
use pipeworks_test_utils::faulty_fs::FaultyFs;

use common::{add_finished, init_tracing, with_timeout, TestResult};

fn settings() -> RuntimeSettings {
    RuntimeSettings {
        poll_interval: Duration::from_millis(20),
        // Let the first loop drain instead of killing when it is dropped.
        kill_on_shutdown: false,
        ..RuntimeSettings::default()
    }
}

fn local(registry: &TaskRegistry) -> Executioner {
    Executioner::spawn(
        LocalBackend::new(&LocalSection::default()).with_cpus(2),
        registry.clone(),
        Arc::new(RealFileSystem),
        settings(),
    )
    .unwrap()
}

#[tokio::test]
async fn running_task_is_reattached_not_rerun() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let runs = dir.path().join("runs");
    let path = dir.path().join("pipeline.chp");

    // First process: start a task and checkpoint while it runs.
    let registry = TaskRegistry::new();
    let first = local(&registry);
    let cmd = format!("echo run >> {}; sleep 0.5", runs.display());
    registry.add(Task::new("long", cmd, dir.path()))?;
    add_finished(
        &registry,
        Task::new("done-before", "true", dir.path()),
        TaskState::FinishedOk,
        Some(0),
    );
    first.submit("long").await?;
    let mut changes = registry.subscribe();
    with_timeout(async {
        while registry.state("long") != Some(TaskState::Running) {
            changes.changed().await.unwrap();
        }
    })
    .await;

    let checkpoint = Checkpoint::capture(&registry, InterpreterState::default(), "test");
    assert!(checkpoint.in_flight.contains_key("long"));
    checkpoint.save(&RealFileSystem, &path)?;

    // Second process: restore and re-attach.
    let plan = RecoveryPlan::from_checkpoint(Checkpoint::load(&RealFileSystem, &path)?);
    assert_eq!(plan.finished, vec!["done-before".to_string()]);
    assert_eq!(plan.reattach.len(), 1);
    assert!(plan.resubmit.is_empty());

    let restored = TaskRegistry::new();
    plan.restore_into(&restored);
    let second = local(&restored);
    for r in &plan.reattach {
        second.reattach(&r.task_id, &r.backend_id).await?;
    }

    let state = with_timeout(restored.wait_terminal("long")).await?;
    assert_eq!(state, TaskState::FinishedOk);
    assert_eq!(std::fs::read_to_string(&runs)?, "run\n");

    second.shutdown(true).await?;
    first.shutdown(true).await?;
    Ok(())
}

#[test]
fn corrupted_checkpoint_aborts_loading() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.chp");
    std::fs::write(&path, "{ not json").unwrap();
    let err = Checkpoint::load(&RealFileSystem, &path).unwrap_err();
    assert!(matches!(err, PipelineError::Checkpoint(_)));
}

#[test]
fn killed_and_failed_tasks_are_scheduled_again() {
    let registry = TaskRegistry::new();
    let w = Path::new("/w");
    add_finished(&registry, Task::new("ok", "true", w), TaskState::FinishedOk, Some(0));
    add_finished(&registry, Task::new("bad", "false", w), TaskState::FinishedError, Some(1));
    add_finished(&registry, Task::new("killed", "sleep", w), TaskState::FinishedKilled, None);
    registry.add(Task::new("fresh", "true", w)).unwrap();

    let plan = RecoveryPlan::from_checkpoint(Checkpoint::capture(
        &registry,
        InterpreterState {
            pipeline_file: Some("Pipeline.toml".into()),
            next_declaration: 4,
        },
        "fatal",
    ));
    assert_eq!(plan.finished, vec!["ok".to_string()]);
    assert_eq!(plan.resubmit, vec!["bad", "killed", "fresh"]);
    assert_eq!(plan.interpreter.next_declaration, 4);

    let restored = TaskRegistry::new();
    plan.restore_into(&restored);
    assert_eq!(restored.state("bad"), Some(TaskState::New));
    assert_eq!(restored.state("ok"), Some(TaskState::FinishedOk));
}

#[test]
fn torn_save_keeps_the_previous_checkpoint_loadable() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("pipeline.chp");
    let registry = TaskRegistry::new();
    registry.add(Task::new("a", "true", dir.path()))?;

    Checkpoint::capture(&registry, InterpreterState::default(), "first failure")
        .save(&RealFileSystem, &path)?;

    registry.add(Task::new("b", "true", dir.path()))?;
    let fs = FaultyFs::new(Arc::new(RealFileSystem));
    fs.tear_writes(true);
    let err = Checkpoint::capture(&registry, InterpreterState::default(), "second failure")
        .save(&fs, &path)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Checkpoint(_)));

    let loaded = Checkpoint::load(&RealFileSystem, &path)?;
    assert_eq!(loaded.reason, "first failure");
    assert_eq!(loaded.tasks.len(), 1);
    Ok(())
}

mod common;

use std::path::Path;

use pipeworks::errors::PipelineError;
use pipeworks::pipeline::Pipeline;
use pipeworks::task::TaskState;
use pipeworks_test_utils::builders::{PipelineFileBuilder, TaskDeclBuilder};

use common::{init_tracing, read, real_context, with_timeout, TestResult};

fn p(dir: &Path, name: &str) -> String {
    dir.join(name).to_string_lossy().into_owned()
}

#[tokio::test]
async fn chain_runs_then_skips_when_up_to_date() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();
    std::fs::write(d.join("data.txt"), "b\na\nc\n")?;
    let runs = p(d, "runs.log");

    let build = || {
        PipelineFileBuilder::new(&d.join("work"))
            .with_task(
                TaskDeclBuilder::new(
                    "sort",
                    &format!("echo sort >> {runs}; sort {} > {}", p(d, "data.txt"), p(d, "sorted.txt")),
                )
                .input(d.join("data.txt"))
                .output(d.join("sorted.txt"))
                .build(),
            )
            .with_task(
                TaskDeclBuilder::new(
                    "count",
                    &format!("echo count >> {runs}; wc -l < {} > {}", p(d, "sorted.txt"), p(d, "count.txt")),
                )
                .input(d.join("sorted.txt"))
                .output(d.join("count.txt"))
                .build(),
            )
            .build()
    };

    let report = with_timeout(Pipeline::new(real_context(build())).run()).await?;
    assert_eq!(report.count(TaskState::FinishedOk), 2);
    assert_eq!(read(d.join("sorted.txt")), "a\nb\nc\n");
    assert_eq!(read(d.join("count.txt")).trim(), "3");
    assert_eq!(read(&runs), "sort\ncount\n");

    // Nothing changed: both declarations are skipped.
    let report = with_timeout(Pipeline::new(real_context(build())).run()).await?;
    assert!(report.task("sort").unwrap().up_to_date);
    assert!(report.task("count").unwrap().up_to_date);
    assert_eq!(read(&runs), "sort\ncount\n");
    Ok(())
}

#[tokio::test]
async fn consumer_waits_for_its_producer_with_free_slots() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .cpus(4)
        .with_task(
            TaskDeclBuilder::new("produce", &format!("sleep 1; echo hi > {}", p(d, "a.txt")))
                .output(d.join("a.txt"))
                .build(),
        )
        .with_task(
            TaskDeclBuilder::new("consume", &format!("cat {} > {}", p(d, "a.txt"), p(d, "b.txt")))
                .input(d.join("a.txt"))
                .output(d.join("b.txt"))
                .build(),
        )
        .build();

    let mut pipeline = Pipeline::new(real_context(config));
    let report = with_timeout(pipeline.run()).await?;
    assert_eq!(report.count(TaskState::FinishedOk), 2);
    assert_eq!(read(d.join("b.txt")), "hi\n");

    let consume = pipeline.context().registry.get("consume").unwrap();
    assert_eq!(consume.dependency.tasks, vec!["produce".to_string()]);
    Ok(())
}

#[tokio::test]
async fn tolerated_failure_blocks_dependents_and_continues() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .with_task(TaskDeclBuilder::new("flaky", "echo broken >&2; exit 4").can_fail().build())
        .with_task(
            TaskDeclBuilder::new("after-flaky", &format!("touch {}", p(d, "never")))
                .after("flaky")
                .build(),
        )
        .with_task(
            TaskDeclBuilder::new("independent", &format!("echo ok > {}", p(d, "ok.txt")))
                .output(d.join("ok.txt"))
                .build(),
        )
        .build();

    let report = with_timeout(Pipeline::new(real_context(config)).run()).await?;
    assert_eq!(report.task("flaky").unwrap().state, TaskState::FinishedError);
    assert_eq!(report.task("flaky").unwrap().exit_code, Some(4));
    assert_eq!(report.task("after-flaky").unwrap().state, TaskState::FinishedError);
    assert_eq!(report.task("independent").unwrap().state, TaskState::FinishedOk);
    assert_eq!(report.failures.len(), 2);
    assert!(!d.join("never").exists());
    Ok(())
}

#[tokio::test]
async fn fatal_failure_checkpoints_and_resume_finishes_the_rest() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();
    let flag = p(d, "flag");
    let counter = p(d, "prepare.log");

    let config = PipelineFileBuilder::new(&d.join("work"))
        .with_task(
            TaskDeclBuilder::new("prepare", &format!("echo run >> {counter}; echo p > {}", p(d, "p.txt")))
                .output(d.join("p.txt"))
                .build(),
        )
        .with_task(
            TaskDeclBuilder::new("check", &format!("test -f {flag}"))
                .after("prepare")
                .build(),
        )
        .build();
    let checkpoint = config.checkpoint_path();

    let err = with_timeout(Pipeline::new(real_context(config.clone())).run())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::TaskFailed { ref task, exit_code: 1 } if task == "check"));
    assert!(checkpoint.exists());

    std::fs::write(&flag, "")?;
    let mut resumed = Pipeline::resume(real_context(config), &checkpoint).await?;
    let report = with_timeout(resumed.run()).await?;

    assert_eq!(report.task("check").unwrap().state, TaskState::FinishedOk);
    assert_eq!(report.task("prepare").unwrap().state, TaskState::FinishedOk);
    // Completed work is never resubmitted.
    assert_eq!(read(&counter), "run\n");
    Ok(())
}

#[tokio::test]
async fn missing_output_fails_validation() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .checkpoint_on_fatal(false)
        .with_task(
            TaskDeclBuilder::new("liar", "true")
                .output(d.join("promised.txt"))
                .build(),
        )
        .build();
    let checkpoint = config.checkpoint_path();

    let err = with_timeout(Pipeline::new(real_context(config)).run())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::OutputValidation { .. }));
    assert!(!checkpoint.exists());
    Ok(())
}

#[tokio::test]
async fn empty_output_passes_only_when_allowed() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .with_task(
            TaskDeclBuilder::new("blank", &format!(": > {}", p(d, "blank.txt")))
                .output(d.join("blank.txt"))
                .allow_empty_output()
                .build(),
        )
        .build();

    let report = with_timeout(Pipeline::new(real_context(config)).run()).await?;
    assert!(report.failures.is_empty());
    Ok(())
}

#[tokio::test]
async fn wait_declaration_sees_earlier_results() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .with_task(TaskDeclBuilder::new("slow", &format!("sleep 0.3; echo x > {}", p(d, "x"))).build())
        .with_task(
            TaskDeclBuilder::new("reader", &format!("cat {} > {}", p(d, "x"), p(d, "y")))
                .wait()
                .build(),
        )
        .build();

    let report = with_timeout(Pipeline::new(real_context(config)).run()).await?;
    assert_eq!(report.count(TaskState::FinishedOk), 2);
    assert_eq!(read(d.join("y")), "x\n");
    Ok(())
}

#[tokio::test]
async fn detached_task_is_handed_off() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .with_task(TaskDeclBuilder::new("daemon", "sleep 3").detached().build())
        .build();

    let report = with_timeout(Pipeline::new(real_context(config)).run()).await?;
    assert_eq!(
        report.task("daemon").unwrap().state,
        TaskState::DetachedHandedOff
    );
    assert!(report.failures.is_empty());
    Ok(())
}

#[tokio::test]
async fn stdin_is_fed_to_the_task() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let d = dir.path();

    let config = PipelineFileBuilder::new(&d.join("work"))
        .with_task(
            TaskDeclBuilder::new("echoer", &format!("cat > {}", p(d, "in.txt")))
                .stdin("fed\n")
                .build(),
        )
        .build();

    with_timeout(Pipeline::new(real_context(config)).run()).await?;
    assert_eq!(read(d.join("in.txt")), "fed\n");
    Ok(())
}

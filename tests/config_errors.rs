use std::io::Write;

use pipeworks::config::load_and_validate;
use pipeworks::errors::PipelineError;
use pipeworks::types::SystemKind;
use tempfile::NamedTempFile;

fn load(toml: &str, system: Option<SystemKind>) -> Result<pipeworks::config::PipelineFile, PipelineError> {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{toml}").unwrap();
    load_and_validate(file.path(), system)
}

#[test]
fn test_after_cycle_is_unresolvable_before_it_is_a_cycle() {
    let result = load(
        r#"
[[task]]
id = "A"
cmd = "echo A"
after = ["B"]

[[task]]
id = "B"
cmd = "echo B"
after = ["A"]
"#,
        None,
    );

    match result {
        Err(PipelineError::DependencyUnresolvable { task, missing }) => {
            assert_eq!(task, "A");
            assert_eq!(missing, "B");
        }
        Err(e) => panic!("Expected DependencyUnresolvable, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_task_id_input_cycle_returns_structured_error() {
    let result = load(
        r#"
[[task]]
id = "A"
cmd = "echo A"
inputs = ["B"]

[[task]]
id = "B"
cmd = "echo B"
inputs = ["A"]
"#,
        None,
    );

    match result {
        Err(PipelineError::DagCycle(msg)) => {
            assert!(msg.contains("cycle detected"));
            assert!(msg.contains('A') || msg.contains('B'));
        }
        Err(e) => panic!("Expected DagCycle error, got: {:?}", e),
        Ok(_) => panic!("Expected error, got Ok"),
    }
}

#[test]
fn test_system_override_is_validated() {
    let toml = r#"
[[task]]
id = "A"
cmd = "echo A"
"#;
    assert!(load(toml, None).is_ok());

    match load(toml, Some(SystemKind::Cluster)) {
        Err(PipelineError::Configuration(msg)) => assert!(msg.contains("[cluster].submit")),
        other => panic!("Expected Configuration error, got: {:?}", other),
    }
}

#[test]
fn test_malformed_toml_is_reported() {
    let result = load("[[task]\nid = ", None);
    assert!(matches!(result, Err(PipelineError::TomlError(_))));
}

#[test]
fn test_missing_file_is_an_io_error() {
    let result = load_and_validate("/definitely/not/here/Pipeline.toml", None);
    assert!(matches!(result, Err(PipelineError::IoError(_))));
}

#[test]
fn test_full_file_parses_every_section() {
    let pipeline = load(
        r#"
[config]
system = "local"
poll_interval = "100ms"
heartbeat_timeout = "2m"
work_dir = "/tmp/pw"

[local]
cpus = 3
launcher = "exec"

[cluster]
submit = ["sbatch", "--parsable"]
kill = ["scancel"]

[[task]]
id = "fetch"
cmd = "curl -o raw.csv https://example.invalid/raw.csv"
outputs = ["raw.csv"]
timeout = "10m"

[[task]]
id = "crunch"
cmd = "crunch raw.csv > out.csv"
inputs = ["raw.csv", "fetch"]
outputs = ["out.csv"]
system = "cluster"
resources = { cpus = "8", mem = "16G" }
can_fail = true
"#,
        None,
    )
    .unwrap();

    assert_eq!(pipeline.tasks.len(), 2);
    assert_eq!(pipeline.local.cpus, Some(3));
    assert_eq!(pipeline.system_for(&pipeline.tasks[1]), SystemKind::Cluster);
    assert_eq!(
        pipeline.settings().heartbeat_timeout,
        Some(std::time::Duration::from_secs(120))
    );
    assert_eq!(
        pipeline.checkpoint_path(),
        std::path::PathBuf::from("/tmp/pw/pipeline.chp")
    );
    let crunch = pipeline.task("crunch").unwrap();
    assert!(crunch.can_fail);
    assert_eq!(crunch.resources.get("mem").map(String::as_str), Some("16G"));
}

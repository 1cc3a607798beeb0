// src/config/validate.rs

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;

use crate::config::model::{PipelineFile, RawPipelineFile, RuntimeSettings};
use crate::errors::{PipelineError, Result};
use crate::types::{parse_duration, SystemKind};

impl TryFrom<RawPipelineFile> for PipelineFile {
    type Error = PipelineError;

    fn try_from(raw: RawPipelineFile) -> std::result::Result<Self, Self::Error> {
        let settings = validate_raw_pipeline(&raw)?;
        Ok(PipelineFile::new_unchecked(raw, settings))
    }
}

fn validate_raw_pipeline(cfg: &RawPipelineFile) -> Result<RuntimeSettings> {
    ensure_has_tasks(cfg)?;
    let settings = validate_global_config(cfg)?;
    validate_task_ids(cfg)?;
    validate_task_fields(cfg)?;
    validate_task_dependencies(cfg)?;
    validate_dag(cfg)?;
    validate_systems(cfg)?;
    Ok(settings)
}

fn config_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(msg.into())
}

fn duration(field: &str, value: &str) -> Result<std::time::Duration> {
    parse_duration(value).map_err(|e| config_error(format!("{field}: {e}")))
}

fn ensure_has_tasks(cfg: &RawPipelineFile) -> Result<()> {
    if cfg.task.is_empty() {
        return Err(config_error(
            "pipeline must contain at least one [[task]] section",
        ));
    }
    Ok(())
}

fn validate_global_config(cfg: &RawPipelineFile) -> Result<RuntimeSettings> {
    let c = &cfg.config;
    if c.queue_length == 0 {
        return Err(config_error("[config].queue_length must be >= 1 (got 0)"));
    }
    let poll_interval = duration("[config].poll_interval", &c.poll_interval)?;
    if poll_interval.is_zero() {
        return Err(config_error("[config].poll_interval must be greater than zero"));
    }
    let heartbeat_timeout = c
        .heartbeat_timeout
        .as_deref()
        .map(|t| duration("[config].heartbeat_timeout", t))
        .transpose()?;
    let exit_file_grace = duration("[config].exit_file_grace", &c.exit_file_grace)?;

    if cfg.local.cpus == Some(0) {
        return Err(config_error("[local].cpus must be >= 1 (got 0)"));
    }

    Ok(RuntimeSettings {
        poll_interval,
        queue_length: c.queue_length,
        heartbeat_timeout,
        exit_file_grace,
        kill_on_shutdown: c.kill_on_shutdown,
    })
}

/// Ids name files (`{id}.sh`, `{id}.exitCode`), so keep them path-safe.
fn validate_task_ids(cfg: &RawPipelineFile) -> Result<()> {
    let mut seen = HashSet::new();
    for task in &cfg.task {
        let id = task.id.as_str();
        if id.is_empty() {
            return Err(config_error("task id must not be empty"));
        }
        if id.starts_with('.')
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(config_error(format!(
                "task id '{id}' may only contain letters, digits, '_', '-' and '.' \
                 and must not start with '.'"
            )));
        }
        if !seen.insert(id) {
            return Err(config_error(format!("duplicate task id '{id}'")));
        }
    }
    Ok(())
}

fn validate_task_fields(cfg: &RawPipelineFile) -> Result<()> {
    for task in &cfg.task {
        if task.cmd.trim().is_empty() {
            return Err(config_error(format!("task '{}' has an empty `cmd`", task.id)));
        }
        if let Some(t) = &task.timeout {
            duration(&format!("task '{}' timeout", task.id), t)?;
        }
    }
    Ok(())
}

fn validate_task_dependencies(cfg: &RawPipelineFile) -> Result<()> {
    let all: HashSet<&str> = cfg.task.iter().map(|t| t.id.as_str()).collect();
    let mut declared: HashSet<&str> = HashSet::new();

    for task in &cfg.task {
        for dep in &task.after {
            if dep == &task.id {
                return Err(config_error(format!(
                    "task '{}' cannot depend on itself in `after`",
                    task.id
                )));
            }
            // Prerequisites must already be registered when this task is
            // declared, so forward references are as unresolvable as typos.
            if !declared.contains(dep.as_str()) {
                return Err(PipelineError::DependencyUnresolvable {
                    task: task.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
        for out in &task.outputs {
            if all.contains(out.as_str()) {
                return Err(PipelineError::ContractViolation(format!(
                    "cannot have task as a dependency output, task id: '{}' (in task '{}')",
                    out, task.id
                )));
            }
        }
        declared.insert(task.id.as_str());
    }
    Ok(())
}

fn validate_dag(cfg: &RawPipelineFile) -> Result<()> {
    // Edge direction: prerequisite -> task.
    // `after` edges, task-id inputs, and producer -> consumer file edges.
    // Forward `after` references are rejected earlier, so a cycle here runs
    // through files: `a` reads what `b` writes and `b` reads what `a` writes.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    let ids: HashSet<&str> = cfg.task.iter().map(|t| t.id.as_str()).collect();
    let mut producers: HashMap<&str, Vec<&str>> = HashMap::new();

    for task in &cfg.task {
        graph.add_node(task.id.as_str());
        for out in &task.outputs {
            producers.entry(out.as_str()).or_default().push(task.id.as_str());
        }
    }

    for task in &cfg.task {
        for dep in &task.after {
            graph.add_edge(dep.as_str(), task.id.as_str(), ());
        }
        for input in &task.inputs {
            if ids.contains(input.as_str()) {
                graph.add_edge(input.as_str(), task.id.as_str(), ());
            }
            for producer in producers.get(input.as_str()).into_iter().flatten() {
                if *producer != task.id {
                    graph.add_edge(*producer, task.id.as_str(), ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(PipelineError::DagCycle(format!(
            "cycle detected in task graph involving task '{}'",
            cycle.node_id()
        ))),
    }
}

fn validate_systems(cfg: &RawPipelineFile) -> Result<()> {
    let used: HashSet<SystemKind> = cfg
        .task
        .iter()
        .map(|t| t.system.unwrap_or(cfg.config.system))
        .collect();

    if used.contains(&SystemKind::Cluster) {
        let c = &cfg.cluster;
        if c.submit.is_empty() {
            return Err(config_error("[cluster].submit is required for cluster tasks"));
        }
        if c.kill.is_empty() {
            return Err(config_error("[cluster].kill is required for cluster tasks"));
        }
        Regex::new(&c.job_id_regex)
            .map_err(|e| config_error(format!("[cluster].job_id_regex: {e}")))?;
    }

    if used.contains(&SystemKind::Cloud) {
        let c = &cfg.cloud;
        if c.provision.is_empty() {
            return Err(config_error("[cloud].provision is required for cloud tasks"));
        }
        if c.terminate.is_empty() {
            return Err(config_error("[cloud].terminate is required for cloud tasks"));
        }
        if c.queue_dir.is_none() {
            return Err(config_error("[cloud].queue_dir is required for cloud tasks"));
        }
        if c.bucket_dir.is_none() && c.upload.is_empty() {
            return Err(config_error(
                "[cloud] needs either bucket_dir or upload to ship checkpoints",
            ));
        }
        Regex::new(&c.instance_id_regex)
            .map_err(|e| config_error(format!("[cloud].instance_id_regex: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::parse_str;

    fn validate(toml: &str) -> Result<PipelineFile> {
        PipelineFile::try_from(parse_str(toml)?)
    }

    #[test]
    fn minimal_pipeline_gets_defaults() {
        let p = validate(
            r#"
            [[task]]
            id = "a"
            cmd = "echo a"
            "#,
        )
        .unwrap();
        assert_eq!(p.settings().poll_interval, std::time::Duration::from_millis(250));
        assert_eq!(p.system_for(&p.tasks[0]), SystemKind::Local);
        assert!(p.config.checkpoint_on_fatal);
    }

    #[test]
    fn forward_after_reference_is_unresolvable() {
        let err = validate(
            r#"
            [[task]]
            id = "a"
            cmd = "true"
            after = ["b"]

            [[task]]
            id = "b"
            cmd = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DependencyUnresolvable { .. }));
    }

    #[test]
    fn file_cycles_are_detected() {
        let err = validate(
            r#"
            [[task]]
            id = "a"
            cmd = "true"
            inputs = ["y"]
            outputs = ["x"]

            [[task]]
            id = "b"
            cmd = "true"
            inputs = ["x"]
            outputs = ["y"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::DagCycle(_)));
    }

    #[test]
    fn task_id_as_output_is_a_contract_violation() {
        let err = validate(
            r#"
            [[task]]
            id = "a"
            cmd = "true"

            [[task]]
            id = "b"
            cmd = "true"
            outputs = ["a"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation(_)));
    }

    #[test]
    fn cloud_tasks_need_provisioning_commands() {
        let err = validate(
            r#"
            [config]
            system = "cloud"

            [[task]]
            id = "a"
            cmd = "true"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn bad_durations_and_ids_are_rejected() {
        assert!(validate("[config]\npoll_interval = \"fast\"\n[[task]]\nid = \"a\"\ncmd = \"x\"").is_err());
        assert!(validate("[[task]]\nid = \"a/b\"\ncmd = \"x\"").is_err());
        assert!(validate("[[task]]\nid = \"a\"\ncmd = \"x\"\ntimeout = \"soon\"").is_err());
        assert!(validate("[[task]]\nid = \"a\"\ncmd = \"x\"\n[[task]]\nid = \"a\"\ncmd = \"y\"").is_err());
    }
}

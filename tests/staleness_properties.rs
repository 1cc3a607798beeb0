mod common;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pipeworks::fs::mock::MockFileSystem;
use pipeworks::task::{Task, TaskDependency, TaskRegistry, TaskState};
use proptest::prelude::*;

use common::{add_finished, add_running};

fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(10_000_000 + secs)
}

/// Mock tree with the given inputs and outputs, each non-empty and stamped.
fn fixture(inputs: &[u64], outputs: &[u64]) -> (MockFileSystem, TaskDependency) {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    let mut dep = TaskDependency::default();
    for (i, t) in inputs.iter().enumerate() {
        let path = format!("/data/in{i}");
        fs.add_file(&path, "x");
        fs.set_modified(&path, at(*t));
        dep.add_input(&path, &registry);
    }
    for (i, t) in outputs.iter().enumerate() {
        let path = format!("/data/out{i}");
        fs.add_file(&path, "x");
        fs.set_modified(&path, at(*t));
        dep.add_output(&path, &registry).unwrap();
    }
    (fs, dep)
}

proptest! {
    #[test]
    fn stale_exactly_when_oldest_output_predates_newest_input(
        inputs in proptest::collection::vec(0u64..50, 1..5),
        outputs in proptest::collection::vec(0u64..50, 1..5),
    ) {
        let (fs, dep) = fixture(&inputs, &outputs);
        let min_out = outputs.iter().min().unwrap();
        let max_in = inputs.iter().max().unwrap();
        let stale = dep.is_stale(&fs, &TaskRegistry::new()).unwrap();
        prop_assert_eq!(stale, min_out < max_in);
    }

    #[test]
    fn empty_output_forces_a_run(
        inputs in proptest::collection::vec(0u64..50, 0..4),
        outputs in proptest::collection::vec(100u64..150, 0..4),
        empty_is_dir in any::<bool>(),
    ) {
        let (fs, mut dep) = fixture(&inputs, &outputs);
        let empty = PathBuf::from("/data/empty");
        if empty_is_dir {
            fs.add_dir(&empty);
        } else {
            fs.add_file(&empty, "");
        }
        fs.set_modified(&empty, at(1_000));
        dep.add_output(empty.to_str().unwrap(), &TaskRegistry::new()).unwrap();
        prop_assert!(dep.is_stale(&fs, &TaskRegistry::new()).unwrap());
    }

    #[test]
    fn missing_input_forces_a_run(
        inputs in proptest::collection::vec(0u64..50, 0..4),
        outputs in proptest::collection::vec(100u64..150, 1..4),
    ) {
        let (fs, mut dep) = fixture(&inputs, &outputs);
        dep.add_input("/data/not-there", &TaskRegistry::new());
        prop_assert!(dep.is_stale(&fs, &TaskRegistry::new()).unwrap());
    }
}

#[test]
fn vacuous_dependency_always_runs() {
    let fs = MockFileSystem::new();
    let dep = TaskDependency::default();
    assert!(dep.is_stale(&fs, &TaskRegistry::new()).unwrap());
}

#[test]
fn equal_timestamps_are_up_to_date() {
    let (fs, dep) = fixture(&[7, 3], &[7, 9]);
    assert!(!dep.is_stale(&fs, &TaskRegistry::new()).unwrap());
}

#[test]
fn outputs_only_or_inputs_only_compare_against_nothing() {
    let (fs, dep) = fixture(&[], &[5]);
    assert!(!dep.is_stale(&fs, &TaskRegistry::new()).unwrap());
    let (fs, dep) = fixture(&[5], &[]);
    assert!(!dep.is_stale(&fs, &TaskRegistry::new()).unwrap());
}

#[test]
fn input_from_an_unfinished_producer_forces_a_run() {
    // T1 writes a.txt, T2 reads it and writes b.txt.
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    let work = Path::new("/w");

    let mut t1_dep = TaskDependency::default();
    t1_dep.add_output("/w/a.txt", &registry).unwrap();
    let t1 = Task::new("T1", "make a", work).with_dependency(t1_dep);

    let mut t2_dep = TaskDependency::default();
    t2_dep.add_input("/w/a.txt", &registry);
    t2_dep.add_output("/w/b.txt", &registry).unwrap();

    // Before T1 ran nothing exists.
    assert!(t2_dep.is_stale(&fs, &registry).unwrap());

    // T1 running: even with both files present and b newer, T2 must run.
    add_running(&registry, t1);
    fs.add_file("/w/a.txt", "a");
    fs.add_file("/w/b.txt", "b");
    fs.set_modified("/w/a.txt", at(1));
    fs.set_modified("/w/b.txt", at(2));
    assert!(t2_dep.is_stale(&fs, &registry).unwrap());

    // T1 done: plain timestamp rule again.
    registry
        .mark_finished("T1", TaskState::FinishedOk, Some(0))
        .unwrap();
    assert!(!t2_dep.is_stale(&fs, &registry).unwrap());

    fs.set_modified("/w/a.txt", at(3));
    assert!(t2_dep.is_stale(&fs, &registry).unwrap());
}

#[test]
fn task_ids_on_the_input_side_become_prerequisites() {
    let registry = TaskRegistry::new();
    add_finished(
        &registry,
        Task::new("prep", "true", Path::new("/w")),
        TaskState::FinishedOk,
        Some(0),
    );
    let mut dep = TaskDependency::default();
    dep.add_input("prep", &registry);
    assert_eq!(dep.tasks, vec!["prep".to_string()]);
    assert!(dep.inputs.is_empty());
    assert!(dep.add_output("prep", &registry).is_err());
}

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pipeworks::fs::mock::MockFileSystem;
use pipeworks::fs::FileSystem;
use pipeworks::monitor::{
    ExitFileMonitor, MemoryQueue, Message, MessageKind, MessageQueue, QueueMonitor,
};
use pipeworks::task::{Task, TaskRegistry, TaskState};
use pipeworks_test_utils::faulty_fs::FaultyFs;

use common::add_running;

fn send(queue: &MemoryQueue, id: &str, kind: MessageKind, payload: &str) {
    queue
        .send(&Message::new(id, kind, payload.as_bytes().to_vec()).encode())
        .unwrap();
}

#[test]
fn queue_monitor_assembles_output_and_finishes_once() {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    add_running(&registry, Task::new("Z", "remote job", Path::new("/w")));

    let queue = Arc::new(MemoryQueue::new("q"));
    let mut monitor = QueueMonitor::new(queue.clone(), None);
    send(&queue, "Z", MessageKind::Stdout, "x");
    send(&queue, "Z", MessageKind::Stdout, "y");
    send(&queue, "Z", MessageKind::Exit, "0");

    let watched = vec!["Z".to_string()];
    let outcome = monitor.poll(&watched, &registry, &fs).unwrap();
    assert_eq!(outcome.finished, watched);

    let task = registry.get("Z").unwrap();
    assert_eq!(task.state(), TaskState::FinishedOk);
    assert_eq!(task.exit_code(), Some(0));
    assert_eq!(fs.read_to_string(&task.files().stdout).unwrap(), "xy");
    assert_eq!(fs.read_to_string(&task.files().exit_code).unwrap(), "0");

    // Replaying the exit message changes nothing.
    send(&queue, "Z", MessageKind::Exit, "0");
    let again = monitor.poll(&watched, &registry, &fs).unwrap();
    assert!(again.finished.is_empty());
    assert_eq!(registry.state("Z"), Some(TaskState::FinishedOk));
}

#[test]
fn failing_output_append_does_not_drop_the_exit_message() {
    let fs = FaultyFs::new(Arc::new(MockFileSystem::new()));
    fs.fail_appends(true);
    let registry = TaskRegistry::new();
    add_running(&registry, Task::new("Y", "remote job", Path::new("/w")));

    let queue = Arc::new(MemoryQueue::new("q"));
    let mut monitor = QueueMonitor::new(queue.clone(), None);
    send(&queue, "Y", MessageKind::Stdout, "lost");
    send(&queue, "Y", MessageKind::Stderr, "lost too");
    send(&queue, "Y", MessageKind::Exit, "0");

    let watched = vec!["Y".to_string()];
    let outcome = monitor.poll(&watched, &registry, &fs).unwrap();
    assert_eq!(outcome.finished, watched);
    assert!(queue.is_empty());

    let task = registry.get("Y").unwrap();
    assert_eq!(task.state(), TaskState::FinishedOk);
    assert_eq!(fs.read_to_string(&task.files().exit_code).unwrap(), "0");
    assert!(!fs.exists(&task.files().stdout));
}

#[test]
fn queue_monitor_ignores_unknown_tasks_and_garbage() {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    let queue = Arc::new(MemoryQueue::new("q"));
    let mut monitor = QueueMonitor::new(queue.clone(), None);

    queue.send("not a message").unwrap();
    send(&queue, "ghost", MessageKind::Exit, "0");

    let outcome = monitor.poll(&[], &registry, &fs).unwrap();
    assert!(outcome.finished.is_empty());
    assert!(queue.is_empty());
}

#[test]
fn silent_task_is_reported_stalled() {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    add_running(&registry, Task::new("quiet", "sleep", Path::new("/w")));
    let queue = Arc::new(MemoryQueue::new("q"));
    let mut monitor = QueueMonitor::new(queue.clone(), Some(Duration::from_millis(30)));
    let watched = vec!["quiet".to_string()];

    assert!(monitor.poll(&watched, &registry, &fs).unwrap().stalled.is_empty());
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(monitor.poll(&watched, &registry, &fs).unwrap().stalled, watched);

    // A heartbeat resets the clock.
    send(&queue, "quiet", MessageKind::Heartbeat, "");
    assert!(monitor.poll(&watched, &registry, &fs).unwrap().stalled.is_empty());
}

#[test]
fn exit_code_137_is_an_error_not_a_kill() {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    let task = Task::new("big", "run big", Path::new("/w"));
    let exit_file = task.files().exit_code.clone();
    add_running(&registry, task);

    let mut monitor = ExitFileMonitor::new();
    let watched = vec!["big".to_string()];
    assert!(monitor.poll(&watched, &registry, &fs).unwrap().finished.is_empty());

    fs.add_file(&exit_file, "137\n");
    let outcome = monitor.poll(&watched, &registry, &fs).unwrap();
    assert_eq!(outcome.finished, watched);
    let task = registry.get("big").unwrap();
    assert_eq!(task.state(), TaskState::FinishedError);
    assert_eq!(task.exit_code(), Some(137));
}

#[test]
fn exit_file_with_timeout_text_marks_the_task_timed_out() {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    let task = Task::new("slow", "run slow", Path::new("/w"));
    fs.add_file(&task.files().exit_code, "Time out");
    add_running(&registry, task);

    ExitFileMonitor::new()
        .poll(&["slow".to_string()], &registry, &fs)
        .unwrap();
    let task = registry.get("slow").unwrap();
    assert_eq!(task.state(), TaskState::FinishedError);
    assert!(task.timed_out());
}

#[test]
fn half_written_exit_file_is_not_read_yet() {
    let fs = MockFileSystem::new();
    let registry = TaskRegistry::new();
    let task = Task::new("w", "x", Path::new("/w"));
    fs.add_file(&task.files().exit_code, "");
    add_running(&registry, task);

    let outcome = ExitFileMonitor::new()
        .poll(&["w".to_string()], &registry, &fs)
        .unwrap();
    assert!(outcome.finished.is_empty());
    assert_eq!(registry.state("w"), Some(TaskState::Running));
}

//! Integration tests for the task registry: graph integrity, the ready-set
//! admission gate, and snapshot persistence.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use foreman_core::ForemanError;
use foreman_task::{Task, TaskRegistry, TaskStatus};

fn task(id: &str) -> Task {
    Task::new(id, format!("Task {id}"))
}

#[test]
fn add_and_get() {
    let registry = TaskRegistry::new();
    registry.add(task("ua-001")).unwrap();

    let stored = registry.get("ua-001").unwrap();
    assert_eq!(stored.title, "Task ua-001");
    assert!(matches!(
        registry.get("missing"),
        Err(ForemanError::NotFound(id)) if id == "missing"
    ));
}

#[test]
fn add_rejects_duplicate_id() {
    let registry = TaskRegistry::new();
    registry.add(task("ua-001")).unwrap();
    assert!(matches!(
        registry.add(task("ua-001")),
        Err(ForemanError::DuplicateId(_))
    ));
    assert_eq!(registry.len(), 1);
}

#[test]
fn add_rejects_unknown_dependency() {
    let registry = TaskRegistry::new();
    let result = registry.add(task("ua-002").with_deps(vec!["ua-001".into()]));
    assert!(matches!(
        result,
        Err(ForemanError::UnknownDependency { task, dep })
            if task == "ua-002" && dep == "ua-001"
    ));
    // A failed add leaves the registry unchanged.
    assert!(registry.is_empty());
}

#[test]
fn update_rejects_missing_and_invalid() {
    let registry = TaskRegistry::new();
    assert!(matches!(
        registry.update(task("ghost")),
        Err(ForemanError::NotFound(_))
    ));

    registry.add(task("ua-001")).unwrap();
    let invalid = Task::new("ua-001", "");
    assert!(matches!(
        registry.update(invalid),
        Err(ForemanError::Validation(_))
    ));
    assert_eq!(registry.get("ua-001").unwrap().title, "Task ua-001");
}

#[test]
fn cycle_introduced_by_update_is_rejected() {
    // A -> B -> C built up sequentially; the edge closing the loop back to A
    // must fail, and the registry must be unchanged by the failed update.
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();
    registry.add(task("b").with_deps(vec!["a".into()])).unwrap();
    registry.add(task("c").with_deps(vec!["b".into()])).unwrap();

    let before: Vec<Task> = registry.list();
    let result = registry.update(task("a").with_deps(vec!["c".into()]));
    assert!(matches!(result, Err(ForemanError::CircularDependency(id)) if id == "a"));

    let after: Vec<Task> = registry.list();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.id, a.id);
        assert_eq!(b.deps, a.deps);
        assert_eq!(b.updated_at, a.updated_at);
    }
    assert!(registry.get("a").unwrap().deps.is_empty());
}

#[test]
fn self_dependency_is_rejected() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();
    assert!(matches!(
        registry.update(task("a").with_deps(vec!["a".into()])),
        Err(ForemanError::Validation(_))
    ));
}

#[test]
fn delete_guards_dependents() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();
    registry.add(task("b").with_deps(vec!["a".into()])).unwrap();

    assert!(matches!(
        registry.delete("a"),
        Err(ForemanError::HasDependents { id, dependent })
            if id == "a" && dependent == "b"
    ));

    registry.delete("b").unwrap();
    registry.delete("a").unwrap();
    assert!(registry.is_empty());

    assert!(matches!(
        registry.delete("a"),
        Err(ForemanError::NotFound(_))
    ));
}

#[test]
fn list_queries_return_empty_not_panic() {
    let registry = TaskRegistry::new();
    assert!(registry.list().is_empty());
    assert!(registry.list_by_status(TaskStatus::Failed).is_empty());
    assert!(registry.list_by_repo("nowhere").is_empty());
    assert!(registry.get_ready().is_empty());
}

#[test]
fn list_by_status_and_repo() {
    let registry = TaskRegistry::new();
    let mut a = task("a");
    a.repo = "api".into();
    let mut b = task("b");
    b.repo = "web".into();
    registry.add(a).unwrap();
    registry.add(b).unwrap();

    registry.set_status("a", TaskStatus::InProgress).unwrap();

    assert_eq!(registry.list_by_status(TaskStatus::Pending).len(), 1);
    assert_eq!(registry.list_by_status(TaskStatus::InProgress).len(), 1);
    assert_eq!(registry.list_by_repo("api")[0].id, "a");
    assert_eq!(registry.list_by_repo("web")[0].id, "b");
}

#[test]
fn ready_set_admits_only_completed_deps() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();
    registry.add(task("b").with_deps(vec!["a".into()])).unwrap();

    let ready: Vec<String> = registry.get_ready().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, vec!["a"]);

    // Repeated queries without mutation return the same set.
    let again: Vec<String> = registry.get_ready().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, again);

    registry.set_status("a", TaskStatus::InProgress).unwrap();
    assert!(registry.get_ready().is_empty());

    registry.set_status("a", TaskStatus::Complete).unwrap();
    let ready: Vec<String> = registry.get_ready().into_iter().map(|t| t.id).collect();
    assert_eq!(ready, vec!["b"]);
}

#[test]
fn ready_set_ignores_failed_deps() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();
    registry.add(task("b").with_deps(vec!["a".into()])).unwrap();

    registry.set_status("a", TaskStatus::InProgress).unwrap();
    registry.set_status("a", TaskStatus::Failed).unwrap();
    assert!(registry.get_ready().iter().all(|t| t.id != "b"));
}

#[test]
fn deps_and_dependents_resolve_task_objects() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();
    registry.add(task("b").with_deps(vec!["a".into()])).unwrap();
    registry.add(task("c").with_deps(vec!["a".into()])).unwrap();

    let deps = registry.get_deps("b").unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].id, "a");
    assert!(registry.get_deps("a").unwrap().is_empty());

    let dependents: Vec<String> = registry
        .get_dependents("a")
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(dependents, vec!["b", "c"]);

    assert!(registry.get_deps("missing").is_err());
    assert!(registry.get_dependents("missing").is_err());
}

#[test]
fn validate_deps_is_a_pure_precheck() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();

    assert!(registry
        .validate_deps(&task("candidate").with_deps(vec!["a".into()]))
        .is_ok());
    assert!(registry
        .validate_deps(&task("candidate").with_deps(vec!["ghost".into()]))
        .is_err());
    assert_eq!(registry.len(), 1);
}

#[test]
fn set_status_enforces_state_machine() {
    let registry = TaskRegistry::new();
    registry.add(task("a")).unwrap();

    assert!(matches!(
        registry.set_status("a", TaskStatus::Complete),
        Err(ForemanError::InvalidTransition { .. })
    ));
    registry.set_status("a", TaskStatus::InProgress).unwrap();
    registry.set_status("a", TaskStatus::Failed).unwrap();
    // Re-queue is the only exit from a terminal state.
    let requeued = registry.set_status("a", TaskStatus::Pending).unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
}

#[test]
fn save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");

    let registry = TaskRegistry::new();
    registry
        .add(task("a").with_priority(3).with_model("claude/sonnet"))
        .unwrap();
    registry
        .add(
            task("b")
                .with_deps(vec!["a".into()])
                .with_fallback("codex/gpt-5"),
        )
        .unwrap();
    registry.set_status("a", TaskStatus::InProgress).unwrap();
    registry.set_status("a", TaskStatus::Complete).unwrap();

    let ready_before: Vec<String> = registry.get_ready().into_iter().map(|t| t.id).collect();
    registry.save(&path).unwrap();

    let restored = TaskRegistry::new();
    restored.load(&path).unwrap();

    assert_eq!(restored.len(), 2);
    let a = restored.get("a").unwrap();
    let original_a = registry.get("a").unwrap();
    assert_eq!(a.status, TaskStatus::Complete);
    assert_eq!(a.created_at, original_a.created_at);
    assert_eq!(a.updated_at, original_a.updated_at);
    assert_eq!(restored.get("b").unwrap().deps, vec!["a".to_string()]);

    let ready_after: Vec<String> = restored.get_ready().into_iter().map(|t| t.id).collect();
    assert_eq!(ready_before, ready_after);
}

#[test]
fn save_creates_missing_data_directory() {
    // First save on a fresh machine: the data directory does not exist yet.
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(".foreman").join("tasks.json");

    let registry = TaskRegistry::new();
    registry.add(task("first")).unwrap();
    registry.save(&path).unwrap();

    let restored = TaskRegistry::new();
    restored.load(&path).unwrap();
    assert_eq!(restored.get("first").unwrap().id, "first");
}

#[test]
fn load_accepts_forward_references_in_file_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    // `b` depends on `a` but appears first in the file.
    std::fs::write(
        &path,
        r#"{"tasks": [
            {"id": "b", "title": "B", "deps": ["a"]},
            {"id": "a", "title": "A"}
        ]}"#,
    )
    .unwrap();

    let registry = TaskRegistry::new();
    registry.load(&path).unwrap();
    assert_eq!(registry.len(), 2);
}

#[test]
fn load_with_dangling_dep_fails_and_empties_registry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(
        &path,
        r#"{"tasks": [
            {"id": "a", "title": "A", "deps": ["ghost"]}
        ]}"#,
    )
    .unwrap();

    let registry = TaskRegistry::new();
    registry.add(task("pre-existing")).unwrap();

    assert!(matches!(
        registry.load(&path),
        Err(ForemanError::UnknownDependency { .. })
    ));
    assert!(registry.is_empty());
}

#[test]
fn load_missing_file_is_an_error() {
    let registry = TaskRegistry::new();
    assert!(matches!(
        registry.load("/nonexistent/tasks.json"),
        Err(ForemanError::Io(_))
    ));
}

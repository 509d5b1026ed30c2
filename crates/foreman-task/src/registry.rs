use crate::task::{Task, TaskStatus};
use chrono::Utc;
use foreman_core::{ForemanError, ForemanResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const GREY: u8 = 1;
const BLACK: u8 = 2;

struct Inner {
    tasks: HashMap<String, Task>,
    /// Insertion sequence per task ID, the dispatch tie-break after priority.
    /// Re-derived from file order on load, never persisted.
    seq: HashMap<String, u64>,
    next_seq: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            seq: HashMap::new(),
            next_seq: 0,
        }
    }

    fn insert(&mut self, task: Task) {
        let id = task.id.clone();
        self.tasks.insert(id.clone(), task);
        if !self.seq.contains_key(&id) {
            self.seq.insert(id, self.next_seq);
            self.next_seq += 1;
        }
    }

    fn validate_deps(&self, task: &Task) -> ForemanResult<()> {
        for dep in &task.deps {
            if !self.tasks.contains_key(dep) {
                return Err(ForemanError::UnknownDependency {
                    task: task.id.clone(),
                    dep: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Three-state DFS from `start`, using `start.deps` for the start node
    /// (the edges the mutation would install) and stored deps elsewhere.
    /// The stored graph is acyclic, so any cycle must pass through `start`
    /// and shows up as a grey back edge.
    fn check_cycle(&self, start: &Task) -> ForemanResult<()> {
        let mut colors: HashMap<&str, u8> = HashMap::new();
        if self.dfs(start, &start.id, &mut colors) {
            return Err(ForemanError::CircularDependency(start.id.clone()));
        }
        Ok(())
    }

    fn dfs<'a>(&'a self, start: &'a Task, id: &'a str, colors: &mut HashMap<&'a str, u8>) -> bool {
        match colors.get(id) {
            Some(&GREY) => return true,
            Some(&BLACK) => return false,
            _ => {}
        }
        colors.insert(id, GREY);
        let deps: &[String] = if id == start.id {
            &start.deps
        } else {
            self.tasks.get(id).map(|t| t.deps.as_slice()).unwrap_or(&[])
        };
        for dep in deps {
            if self.dfs(start, dep, colors) {
                return true;
            }
        }
        colors.insert(id, BLACK);
        false
    }

    fn all_deps_complete(&self, task: &Task) -> bool {
        task.deps.iter().all(|dep| {
            self.tasks
                .get(dep)
                .is_some_and(|t| t.status == TaskStatus::Complete)
        })
    }

    fn sorted_by_seq(&self, mut tasks: Vec<Task>) -> Vec<Task> {
        tasks.sort_by_key(|t| self.seq.get(&t.id).copied().unwrap_or(u64::MAX));
        tasks
    }
}

/// JSON structure of the task snapshot file.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Concurrency-safe store of [`Task`]s with dependency tracking.
///
/// One exclusive lock serializes all reads and writes, including the nested
/// cycle check, so `add`/`update`/`delete` are linearizable with respect to
/// each other and to [`get_ready`](TaskRegistry::get_ready). At all times
/// every stored `deps` entry resolves and the induced graph is acyclic;
/// violations are rejected at write time and leave the stored set unchanged.
pub struct TaskRegistry {
    inner: RwLock<Inner>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Add a new task.
    ///
    /// Fails with [`ForemanError::DuplicateId`] if the ID is taken,
    /// [`ForemanError::Validation`] on missing required fields, or
    /// [`ForemanError::UnknownDependency`] on unresolved deps. On success the
    /// task is immediately visible to [`get_ready`](TaskRegistry::get_ready).
    pub fn add(&self, task: Task) -> ForemanResult<()> {
        task.validate()?;
        let mut inner = self.inner.write();
        if inner.tasks.contains_key(&task.id) {
            return Err(ForemanError::DuplicateId(task.id));
        }
        inner.validate_deps(&task)?;
        // New nodes have no dependents yet, so the only possible cycle runs
        // through the new deps; check it the same way update does.
        inner.check_cycle(&task)?;
        inner.insert(task);
        Ok(())
    }

    /// Return a copy of the task with the given ID.
    pub fn get(&self, id: &str) -> ForemanResult<Task> {
        let inner = self.inner.read();
        inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| ForemanError::NotFound(id.to_string()))
    }

    /// Replace an existing task, refreshing its `updated_at`.
    ///
    /// Fails with [`ForemanError::NotFound`] if absent,
    /// [`ForemanError::Validation`] / [`ForemanError::UnknownDependency`] on
    /// bad fields or deps, or [`ForemanError::CircularDependency`] if the new
    /// `deps` set would create a cycle reachable from the task. A failed
    /// update leaves the stored set unchanged.
    pub fn update(&self, task: Task) -> ForemanResult<()> {
        task.validate()?;
        let mut inner = self.inner.write();
        if !inner.tasks.contains_key(&task.id) {
            return Err(ForemanError::NotFound(task.id));
        }
        inner.validate_deps(&task)?;
        inner.check_cycle(&task)?;
        let mut task = task;
        task.updated_at = Utc::now();
        inner.insert(task);
        Ok(())
    }

    /// Transition a stored task's status through the state machine,
    /// refreshing `updated_at`. Returns the updated task.
    pub fn set_status(&self, id: &str, to: TaskStatus) -> ForemanResult<Task> {
        let mut inner = self.inner.write();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| ForemanError::NotFound(id.to_string()))?;
        task.set_status(to)?;
        Ok(task.clone())
    }

    /// Remove a task.
    ///
    /// Fails with [`ForemanError::NotFound`] if absent, or
    /// [`ForemanError::HasDependents`] if any other task lists `id` in its
    /// deps; dependents must be removed or rewired first.
    pub fn delete(&self, id: &str) -> ForemanResult<()> {
        let mut inner = self.inner.write();
        if !inner.tasks.contains_key(id) {
            return Err(ForemanError::NotFound(id.to_string()));
        }
        if let Some(dependent) = inner
            .tasks
            .values()
            .find(|t| t.deps.iter().any(|d| d == id))
        {
            return Err(ForemanError::HasDependents {
                id: id.to_string(),
                dependent: dependent.id.clone(),
            });
        }
        inner.tasks.remove(id);
        inner.seq.remove(id);
        Ok(())
    }

    /// All tasks, in insertion order.
    pub fn list(&self) -> Vec<Task> {
        let inner = self.inner.read();
        let tasks = inner.tasks.values().cloned().collect();
        inner.sorted_by_seq(tasks)
    }

    /// Tasks with the given status, in insertion order.
    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let inner = self.inner.read();
        let tasks = inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        inner.sorted_by_seq(tasks)
    }

    /// Tasks in the given repo grouping, in insertion order.
    pub fn list_by_repo(&self, repo: &str) -> Vec<Task> {
        let inner = self.inner.read();
        let tasks = inner
            .tasks
            .values()
            .filter(|t| t.repo == repo)
            .cloned()
            .collect();
        inner.sorted_by_seq(tasks)
    }

    /// Tasks that are ready to start: pending, with every dependency
    /// `complete`. A task with no deps is immediately ready. Sorted by
    /// descending priority, ties broken by insertion order. This is the sole
    /// admission gate into execution.
    pub fn get_ready(&self) -> Vec<Task> {
        let inner = self.inner.read();
        let mut ready: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && inner.all_deps_complete(t))
            .cloned()
            .collect();
        ready.sort_by_key(|t| {
            (
                std::cmp::Reverse(t.priority),
                inner.seq.get(&t.id).copied().unwrap_or(u64::MAX),
            )
        });
        ready
    }

    /// The resolved tasks this task depends on.
    pub fn get_deps(&self, id: &str) -> ForemanResult<Vec<Task>> {
        let inner = self.inner.read();
        let task = inner
            .tasks
            .get(id)
            .ok_or_else(|| ForemanError::NotFound(id.to_string()))?;
        Ok(task
            .deps
            .iter()
            .filter_map(|dep| inner.tasks.get(dep).cloned())
            .collect())
    }

    /// The tasks that list `id` in their deps, in insertion order.
    pub fn get_dependents(&self, id: &str) -> ForemanResult<Vec<Task>> {
        let inner = self.inner.read();
        if !inner.tasks.contains_key(id) {
            return Err(ForemanError::NotFound(id.to_string()));
        }
        let dependents = inner
            .tasks
            .values()
            .filter(|t| t.deps.iter().any(|d| d == id))
            .cloned()
            .collect();
        Ok(inner.sorted_by_seq(dependents))
    }

    /// Pre-check that every dependency of `task` resolves, without storing it.
    pub fn validate_deps(&self, task: &Task) -> ForemanResult<()> {
        self.inner.read().validate_deps(task)
    }

    /// Number of stored tasks.
    pub fn len(&self) -> usize {
        self.inner.read().tasks.len()
    }

    /// Whether the registry holds no tasks.
    pub fn is_empty(&self) -> bool {
        self.inner.read().tasks.is_empty()
    }

    /// Write the full task set to `path` as pretty-printed JSON, tasks in
    /// insertion order. Missing parent directories are created, so the first
    /// save into a fresh data directory succeeds.
    pub fn save(&self, path: impl AsRef<Path>) -> ForemanResult<()> {
        let path = path.as_ref();
        let snapshot = {
            let inner = self.inner.read();
            let tasks = inner.tasks.values().cloned().collect();
            Snapshot {
                tasks: inner.sorted_by_seq(tasks),
            }
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Replace the in-memory set with the snapshot at `path`.
    ///
    /// Tasks are field-validated and installed first, then every dependency
    /// edge is re-validated against the complete set, so a task may depend on
    /// one that appears later in file order. On any failure the registry is
    /// left empty and the error is returned; callers must not continue with
    /// a registry whose load failed.
    pub fn load(&self, path: impl AsRef<Path>) -> ForemanResult<()> {
        let json = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&json)?;

        let mut inner = self.inner.write();
        *inner = Inner::new();

        if let Err(e) = Self::install_snapshot(&mut *inner, snapshot) {
            *inner = Inner::new();
            return Err(e);
        }
        Ok(())
    }

    fn install_snapshot(inner: &mut Inner, snapshot: Snapshot) -> ForemanResult<()> {
        // First pass: field-validate and install every task.
        for task in snapshot.tasks {
            task.validate()?;
            if inner.tasks.contains_key(&task.id) {
                return Err(ForemanError::DuplicateId(task.id));
            }
            inner.insert(task);
        }

        // Second pass: every edge must resolve against the complete set.
        let ids: Vec<String> = inner.tasks.keys().cloned().collect();
        for id in ids {
            let task = inner.tasks[&id].clone();
            inner.validate_deps(&task)?;
        }
        Ok(())
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn ready_set_orders_by_priority_then_insertion() {
        let registry = TaskRegistry::new();
        registry.add(Task::new("low", "Low").with_priority(1)).unwrap();
        registry.add(Task::new("high", "High").with_priority(5)).unwrap();
        registry.add(Task::new("also-high", "Also high").with_priority(5)).unwrap();

        let ready: Vec<String> = registry.get_ready().into_iter().map(|t| t.id).collect();
        assert_eq!(ready, vec!["high", "also-high", "low"]);
    }

    #[test]
    fn update_preserves_insertion_order() {
        let registry = TaskRegistry::new();
        registry.add(Task::new("a", "A")).unwrap();
        registry.add(Task::new("b", "B")).unwrap();
        registry.update(Task::new("a", "A updated")).unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn shared_ancestor_is_not_a_cycle() {
        // a <- b, a <- c, d <- {b, c}: the diamond revisits `a` on two
        // branches but contains no cycle.
        let registry = TaskRegistry::new();
        registry.add(Task::new("a", "A")).unwrap();
        registry
            .add(Task::new("b", "B").with_deps(vec!["a".into()]))
            .unwrap();
        registry
            .add(Task::new("c", "C").with_deps(vec!["a".into()]))
            .unwrap();
        registry
            .add(Task::new("d", "D").with_deps(vec!["b".into(), "c".into()]))
            .unwrap();
        assert!(registry
            .update(
                Task::new("d", "D").with_deps(vec!["b".into(), "c".into(), "a".into()])
            )
            .is_ok());
    }
}

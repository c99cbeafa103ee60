use rustc_hash::FxHashMap;
use std::collections::VecDeque;

use super::node::Node;
use super::types::{BoundaryId, KeyPath, SegmentId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    Render,
    /// Walks a tree whose output was emitted by an earlier request, looking
    /// for postponed boundaries. Produces no output of its own.
    Replay,
}

/// Where a Task's work is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scope {
    pub boundary: Option<BoundaryId>,
    /// Set while rendering the fallback of this boundary.
    pub fallback_of: Option<BoundaryId>,
    pub mode: TaskMode,
}

impl Scope {
    pub fn root(mode: TaskMode) -> Self {
        Self { boundary: None, fallback_of: None, mode }
    }

    pub fn blocks_shell(&self) -> bool {
        self.boundary.is_none() && self.mode == TaskMode::Render
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub node: Node,
    pub key_path: KeyPath,
    pub segment: Option<SegmentId>,
    pub scope: Scope,
}

/// FIFO of ready tasks plus every parked task. Parked tasks only come back
/// through [`TaskQueue::wake`].
#[derive(Debug, Default)]
pub struct TaskQueue {
    ready: VecDeque<TaskId>,
    tasks: FxHashMap<TaskId, Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, task: Task) {
        let id = task.id;
        self.tasks.insert(id, task);
        self.ready.push_back(id);
    }

    pub fn park(&mut self, task: Task) {
        self.tasks.insert(task.id, task);
    }

    pub fn wake(&mut self, id: TaskId) -> bool {
        if self.tasks.contains_key(&id) {
            self.ready.push_back(id);
            true
        } else {
            false
        }
    }

    pub fn next(&mut self) -> Option<Task> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(task) = self.tasks.remove(&id) {
                return Some(task);
            }
        }
        None
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.tasks.remove(&id)
    }

    pub fn drain(&mut self) -> Vec<Task> {
        self.ready.clear();
        let mut tasks: Vec<Task> = self.tasks.drain().map(|(_, task)| task).collect();
        tasks.sort_by_key(|task| task.id);
        tasks
    }

    pub fn has_ready(&self) -> bool {
        self.ready.iter().any(|id| self.tasks.contains_key(id))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

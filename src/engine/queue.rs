// src/engine/queue.rs

//! The working task queue: a live copy of the task DAG, pruned as tasks
//! finish.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::model::{TaskId, Workflow};
use crate::types::TaskStatus;

#[derive(Debug, Clone, Default)]
struct QueueNode {
    /// Parents still in the queue.
    waiting_on: BTreeSet<TaskId>,
    children: Vec<TaskId>,
}

/// Tasks left to run, with in-degree counted over queued parents only.
#[derive(Debug, Clone, Default)]
pub struct TaskQueue {
    nodes: BTreeMap<TaskId, QueueNode>,
}

impl TaskQueue {
    /// Queue every task of `wf` that has not succeeded.
    pub fn from_workflow(wf: &Workflow) -> Self {
        let queued: BTreeSet<TaskId> = wf
            .tasks()
            .filter(|t| t.status != TaskStatus::Successful)
            .map(|t| t.id)
            .collect();

        let mut nodes = BTreeMap::new();
        for id in &queued {
            let Some(task) = wf.task(*id) else {
                continue;
            };
            let node = QueueNode {
                waiting_on: task
                    .parents
                    .iter()
                    .filter(|p| queued.contains(*p))
                    .copied()
                    .collect(),
                children: task
                    .children
                    .iter()
                    .filter(|c| queued.contains(*c))
                    .copied()
                    .collect(),
            };
            nodes.insert(*id, node);
        }
        debug!(tasks = nodes.len(), "built task queue");
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.nodes.keys().copied()
    }

    /// Number of queued parents `id` still waits on.
    pub fn in_degree(&self, id: TaskId) -> Option<usize> {
        self.nodes.get(&id).map(|n| n.waiting_on.len())
    }

    /// Queued tasks with no queued parents, in id order.
    pub fn ready(&self) -> Vec<TaskId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.waiting_on.is_empty())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Remove one task, releasing its children.
    pub fn remove(&mut self, id: TaskId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        for child in node.children {
            if let Some(c) = self.nodes.get_mut(&child) {
                c.waiting_on.remove(&id);
            } else {
                trace!(task = %id, child = %child, "child already left the queue");
            }
        }
        true
    }

    /// Remove `root` and everything reachable from it in the queue.
    ///
    /// Returns the removed ids (root included), in id order.
    pub fn remove_with_descendants(&mut self, root: TaskId) -> Vec<TaskId> {
        let mut stack = vec![root];
        let mut doomed: BTreeSet<TaskId> = BTreeSet::new();

        while let Some(id) = stack.pop() {
            if !doomed.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().copied());
            }
        }

        let removed: Vec<TaskId> = doomed.into_iter().filter(|id| self.nodes.contains_key(id)).collect();
        for id in &removed {
            self.remove(*id);
        }
        removed
    }
}

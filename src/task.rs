//! Dependency-ordered lifecycle task scheduling
//!
//! Every lifecycle operation on a device runs as a task. A task runs only
//! once all of its dependencies have reached a terminal state, may suspend
//! itself by registering further dependencies and returning, and completes
//! exactly once. Completion fans out to dependents, which re-evaluate their
//! own readiness; a failed dependency still satisfies readiness, so one
//! failure does not stall unrelated work.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::coordinator::Coordinator;
use crate::error::TaskStatus;
use crate::ids::{DeviceId, TaskId};

/// The five lifecycle operations a task can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Init,
    Unbind,
    Remove,
    Suspend,
    Resume,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Init => write!(f, "init"),
            TaskKind::Unbind => write!(f, "unbind"),
            TaskKind::Remove => write!(f, "remove"),
            TaskKind::Suspend => write!(f, "suspend"),
            TaskKind::Resume => write!(f, "resume"),
        }
    }
}

/// Callback invoked on the dispatch thread when a task completes.
pub type TaskCompletion = Box<dyn FnOnce(&mut Coordinator, TaskStatus)>;

pub(crate) struct TaskEntry {
    kind: TaskKind,
    device: DeviceId,
    /// Dependencies that have not yet completed.
    deps: HashSet<TaskId>,
    dependents: Vec<TaskId>,
    /// Eligible to run once `deps` drains.
    posted: bool,
    in_ready: bool,
    /// An RPC for this task is outstanding; do not run again.
    sent: bool,
    completed: bool,
    status: Option<TaskStatus>,
    /// First failure among completed dependencies. Task kinds that cannot
    /// proceed past a failed dependency (init, suspend, resume) complete
    /// with this instead of running; unbind/remove ignore it so resource
    /// reclamation always makes forward progress.
    dep_failure: Option<crate::error::TaskError>,
    completion: Option<TaskCompletion>,
}

impl TaskEntry {
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn status(&self) -> Option<&TaskStatus> {
        self.status.as_ref()
    }

    pub fn dependencies(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.deps.iter().copied()
    }
}

/// Holds the set of in-flight tasks and drives dependency ordering.
#[derive(Default)]
pub(crate) struct TaskScheduler {
    tasks: HashMap<TaskId, TaskEntry>,
    ready: VecDeque<TaskId>,
    next_id: u64,
}

impl TaskScheduler {
    /// Allocate a task bound to one device. The task does not start until
    /// [`post`](Self::post) is called and its dependencies drain.
    pub fn create(
        &mut self,
        kind: TaskKind,
        device: DeviceId,
        completion: Option<TaskCompletion>,
    ) -> TaskId {
        self.next_id += 1;
        let id = TaskId(self.next_id);
        self.tasks.insert(
            id,
            TaskEntry {
                kind,
                device,
                deps: HashSet::new(),
                dependents: Vec::new(),
                posted: false,
                in_ready: false,
                sent: false,
                completed: false,
                status: None,
                dep_failure: None,
                completion,
            },
        );
        tracing::debug!(task = %id, kind = %kind, device = %device, "Task created");
        id
    }

    /// Mark the task runnable; it enters the ready queue once no
    /// dependency is outstanding.
    pub fn post(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.posted = true;
        }
        self.enqueue_if_ready(id);
    }

    /// Record that `id` must not run before `dep` completes.
    ///
    /// Depending on an already-completed task is a no-op: the task's run
    /// method re-checks readiness when it executes, so a resolved
    /// dependency never needs to block it.
    pub fn add_dependency(&mut self, id: TaskId, dep: TaskId) {
        if id == dep {
            return;
        }
        let dep_completed = match self.tasks.get(&dep) {
            Some(entry) => entry.completed,
            None => true,
        };
        if dep_completed {
            tracing::trace!(task = %id, dep = %dep, "Dependency already complete");
            return;
        }
        if let Some(entry) = self.tasks.get_mut(&id) {
            if !entry.deps.insert(dep) {
                return;
            }
        } else {
            return;
        }
        if let Some(dep_entry) = self.tasks.get_mut(&dep) {
            dep_entry.dependents.push(id);
        }
    }

    /// Pop the next task that is ready to run.
    pub fn pop_ready(&mut self) -> Option<TaskId> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(entry) = self.tasks.get_mut(&id) {
                entry.in_ready = false;
                if entry.completed || entry.sent || !entry.deps.is_empty() {
                    continue;
                }
                return Some(id);
            }
        }
        None
    }

    /// Put a task back in the ready queue if it is runnable right now.
    /// Used by run methods that re-check readiness after wiring
    /// dependencies that may all have resolved already.
    pub fn enqueue_if_ready(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&id) {
            if entry.posted
                && !entry.completed
                && !entry.sent
                && !entry.in_ready
                && entry.deps.is_empty()
            {
                entry.in_ready = true;
                self.ready.push_back(id);
            }
        }
    }

    /// Record that the task's RPC is in flight; the task will be finished
    /// by [`complete`](Self::complete) when the reply (or a host-death
    /// event) arrives.
    pub fn mark_sent(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.sent = true;
        }
    }

    /// The reply arrived but the task is not finished (it now waits on
    /// dependencies it created); make it runnable again.
    pub fn unmark_sent(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get_mut(&id) {
            entry.sent = false;
        }
        self.enqueue_if_ready(id);
    }

    /// Finalize a task exactly once and release its dependents.
    ///
    /// The outer `Option` is `None` if the task was unknown or already
    /// complete; the inner value is the completion callback (if any) for
    /// the caller to invoke once the scheduler borrow ends.
    pub fn complete(&mut self, id: TaskId, status: TaskStatus) -> Option<Option<TaskCompletion>> {
        let (completion, dependents) = {
            let entry = self.tasks.get_mut(&id)?;
            if entry.completed {
                return None;
            }
            entry.completed = true;
            entry.sent = false;
            entry.status = Some(status.clone());
            tracing::debug!(task = %id, kind = %entry.kind, device = %entry.device,
                ok = status.is_ok(), "Task completed");
            (entry.completion.take(), std::mem::take(&mut entry.dependents))
        };
        let failure = match &status {
            Err(e) => Some(e.clone()),
            Ok(()) => None,
        };
        for dependent in dependents {
            if let Some(entry) = self.tasks.get_mut(&dependent) {
                entry.deps.remove(&id);
                if entry.dep_failure.is_none() {
                    entry.dep_failure = failure.clone();
                }
            }
            self.enqueue_if_ready(dependent);
        }
        Some(completion)
    }

    /// First failure recorded among this task's completed dependencies.
    pub fn dep_failure(&self, id: TaskId) -> Option<crate::error::TaskError> {
        self.tasks.get(&id).and_then(|t| t.dep_failure.clone())
    }

    /// Drop a completed task once its dependents have been released.
    pub fn reap(&mut self, id: TaskId) {
        if let Some(entry) = self.tasks.get(&id) {
            if entry.completed {
                self.tasks.remove(&id);
            }
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        self.tasks.get(&id)
    }

    pub fn is_completed(&self, id: TaskId) -> bool {
        self.tasks.get(&id).map(|t| t.completed).unwrap_or(true)
    }
}

//! C10 — Task Scheduler.
//!
//! Five priority queues, scored node assignment, and retry-with-
//! requeue on failed assignment (§4.6). Owns the in-memory task
//! queues and lifecycle exclusively (§3 ownership summary).

use crate::task::{NodeCapability, Task, TaskStatus};
use duxnet_core::{now, DuxError, DuxResult, NodeId, TaskId};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_tasks_per_node: u32,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct Assignment {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub task: Task,
}

/// Outcome of one scheduling tick: tasks assigned to a node, and tasks
/// that exhausted `max_retries` without finding one. An exhausted task
/// never ran, so it produces no `TaskResult` — the caller is
/// responsible for treating it as a terminal failure (refunding any
/// attached escrow, publishing `DuxEvent::TaskFailed`) since nothing
/// else observes it once it leaves the queue.
#[derive(Debug, Clone, Default)]
pub struct TickOutcome {
    pub assignments: Vec<Assignment>,
    pub exhausted: Vec<Task>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SchedulingMetrics {
    pub total_tasks: u64,
    pub assigned_tasks: u64,
    pub failed_assignments: u64,
}

struct SchedulerState {
    queues: [VecDeque<Task>; 5],
    assignments: HashMap<TaskId, Assignment>,
    node_load: HashMap<NodeId, u32>,
    metrics: SchedulingMetrics,
}

/// Scores a node for a task per §4.6's formula; higher is better.
fn score_node(node: &NodeCapability, task: &Task, rng: &mut impl Rng) -> f64 {
    let mut score = node.cpu_cores as f64 * 10.0
        + node.memory_mb as f64 / 100.0
        + node.success_rate * 50.0
        + node.reputation * 0.5
        + (100.0 - node.avg_execution_time).max(0.0);
    if node.supported_services.contains_key(&task.service_name) {
        score += 100.0;
    }
    score -= node.current_assignments as f64 * 10.0;
    score += rng.gen_range(0.0..1.0);
    score
}

fn fits(node: &NodeCapability, task: &Task) -> bool {
    node.cpu_cores >= task.cpu_cores
        && node.memory_mb >= task.memory_mb
        && node.supported_services.contains_key(&task.service_name)
}

pub struct TaskScheduler {
    state: RwLock<SchedulerState>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            state: RwLock::new(SchedulerState {
                queues: std::array::from_fn(|_| VecDeque::new()),
                assignments: HashMap::new(),
                node_load: HashMap::new(),
                metrics: SchedulingMetrics::default(),
            }),
            config,
        }
    }

    pub fn submit(&self, mut task: Task) -> DuxResult<TaskId> {
        task.validate().map_err(DuxError::validation)?;
        let priority = task.priority.clamp(1, 5) as usize;
        task.status = TaskStatus::Pending;
        let task_id = task.task_id;

        let mut state = self.state.write();
        state.queues[priority - 1].push_back(task);
        state.metrics.total_tasks += 1;
        Ok(task_id)
    }

    /// Cancels a pending task by removing it from every queue, or an
    /// assigned/running task by clearing its assignment (the caller
    /// is responsible for instructing the sandbox to kill the process).
    pub fn cancel(&self, task_id: TaskId) -> DuxResult<TaskStatus> {
        let mut state = self.state.write();
        for queue in state.queues.iter_mut() {
            if let Some(pos) = queue.iter().position(|t| t.task_id == task_id) {
                queue.remove(pos);
                return Ok(TaskStatus::Cancelled);
            }
        }
        if let Some(assignment) = state.assignments.remove(&task_id) {
            if let Some(load) = state.node_load.get_mut(&assignment.node_id) {
                *load = load.saturating_sub(1);
            }
            return Ok(TaskStatus::Cancelled);
        }
        Err(DuxError::validation("unknown or already-terminal task_id"))
    }

    /// One scheduling tick: for priorities 5 down to 1, assigns each
    /// pending task to its highest-scoring eligible node.
    pub fn tick(&self, nodes: &[NodeCapability]) -> TickOutcome {
        let mut rng = rand::thread_rng();
        let mut made = Vec::new();
        let mut exhausted = Vec::new();
        let mut state = self.state.write();

        for priority in (0..5).rev() {
            let mut requeue = VecDeque::new();
            while let Some(task) = state.queues[priority].pop_front() {
                let eligible: Vec<&NodeCapability> = nodes
                    .iter()
                    .filter(|n| fits(n, &task))
                    .filter(|n| {
                        let load = state.node_load.get(&n.node_id).copied().unwrap_or(0);
                        load < self.config.max_tasks_per_node
                    })
                    .collect();

                let best = eligible
                    .iter()
                    .map(|n| (score_node(n, &task, &mut rng), n.node_id))
                    .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

                match best {
                    Some((score, node_id)) => {
                        let mut assigned_task = task.clone();
                        assigned_task.status = TaskStatus::Assigned;
                        assigned_task.assigned_node_id = Some(node_id);
                        let assignment = Assignment { task_id: task.task_id, node_id, task: assigned_task };
                        state.assignments.insert(task.task_id, assignment.clone());
                        *state.node_load.entry(node_id).or_insert(0) += 1;
                        state.metrics.assigned_tasks += 1;
                        info!(task_id = %task.task_id, %node_id, score, "task assigned");
                        made.push(assignment);
                    }
                    None => {
                        let mut task = task;
                        if task.retry_count < self.config.max_retries {
                            task.retry_count += 1;
                            requeue.push_back(task);
                        } else {
                            state.metrics.failed_assignments += 1;
                            task.status = TaskStatus::Failed;
                            warn!(task_id = %task.task_id, "task failed: no-node");
                            exhausted.push(task);
                        }
                    }
                }
            }
            state.queues[priority] = requeue;
        }

        TickOutcome { assignments: made, exhausted }
    }

    pub fn release_node_slot(&self, node_id: NodeId) {
        let mut state = self.state.write();
        if let Some(load) = state.node_load.get_mut(&node_id) {
            *load = load.saturating_sub(1);
        }
    }

    /// Current in-flight assignment count for `node_id`, used to build
    /// the `current_assignments` field of a fresh [`NodeCapability`].
    pub fn load_of(&self, node_id: NodeId) -> u32 {
        self.state.read().node_load.get(&node_id).copied().unwrap_or(0)
    }

    pub fn metrics(&self) -> SchedulingMetrics {
        self.state.read().metrics
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().queues.iter().map(|q| q.len()).sum()
    }
}

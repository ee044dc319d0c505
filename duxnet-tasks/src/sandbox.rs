//! C11 — Execution Sandbox.
//!
//! Abstracted as a `Runtime` capability set {prepare, run, kill,
//! cleanup} per §9's design note, with a native-subprocess variant and
//! a container variant. The sandbox never mutates any other
//! component's state; it only produces a [`TaskResult`].

use crate::task::{Task, TaskResult, TaskStatus};
use async_trait::async_trait;
use duxnet_core::{now, sorted_json_hash, TaskId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// Grace period between SIGTERM and SIGKILL when cancelling a running
/// task (§5's "kills the sandbox within 5 s").
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox runtime unavailable: {0}")]
    RuntimeUnavailable(String),
    #[error("invalid task: {0}")]
    InvalidTask(String),
}

/// An opaque handle to a prepared, running execution environment.
#[derive(Clone, Copy)]
pub struct RuntimeHandle {
    pub id: Uuid,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    async fn prepare(&self, task: &Task) -> Result<RuntimeHandle, SandboxError>;
    async fn run(&self, handle: &RuntimeHandle, task: &Task) -> Result<(String, i32), SandboxError>;
    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), SandboxError>;
    async fn cleanup(&self, handle: &RuntimeHandle) -> Result<(), SandboxError>;
}

/// Runs task code as a native subprocess, the fallback variant when a
/// container runtime is unavailable (§4.8).
pub struct NativeRuntime {
    pub interpreter: String,
    /// Live child pids keyed by runtime handle, so a later `kill` call
    /// (issued from a different task than the one that spawned the
    /// process) can signal it.
    pids: Arc<AsyncMutex<HashMap<Uuid, u32>>>,
}

impl Default for NativeRuntime {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            pids: Arc::new(AsyncMutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl Runtime for NativeRuntime {
    async fn prepare(&self, _task: &Task) -> Result<RuntimeHandle, SandboxError> {
        Ok(RuntimeHandle { id: Uuid::new_v4() })
    }

    async fn run(&self, handle: &RuntimeHandle, task: &Task) -> Result<(String, i32), SandboxError> {
        let input = task
            .input_data
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_default())
            .unwrap_or_default();

        let mut child = Command::new(&self.interpreter)
            .arg("-c")
            .arg(&task.code)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;

        if let Some(pid) = child.id() {
            self.pids.lock().await.insert(handle.id, pid);
        }

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input.as_bytes()).await;
        }

        let deadline = Duration::from_secs(task.timeout_seconds as u64);
        let output = timeout(deadline, child.wait_with_output()).await;
        self.pids.lock().await.remove(&handle.id);

        let output = output
            .map_err(|_| SandboxError::RuntimeUnavailable("wall-clock timeout".into()))?
            .map_err(|e| SandboxError::RuntimeUnavailable(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok((stdout, output.status.code().unwrap_or(-1)))
    }

    /// Sends SIGTERM, waits up to [`KILL_GRACE`], then SIGKILL if the
    /// process is still alive (§5, scenario 6).
    async fn kill(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
        let pid = self.pids.lock().await.get(&handle.id).copied();
        let Some(pid) = pid else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            let pid = pid as libc::pid_t;
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            tokio::time::sleep(KILL_GRACE).await;
            let still_alive = unsafe { libc::kill(pid, 0) == 0 };
            if still_alive {
                warn!(pid, "process survived SIGTERM past grace period, sending SIGKILL");
                unsafe {
                    libc::kill(pid, libc::SIGKILL);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
        }

        self.pids.lock().await.remove(&handle.id);
        Ok(())
    }

    async fn cleanup(&self, handle: &RuntimeHandle) -> Result<(), SandboxError> {
        self.pids.lock().await.remove(&handle.id);
        Ok(())
    }
}

/// The `container` variant behind the same `Runtime` trait as
/// [`NativeRuntime`] (§4.8). No Docker/OCI driver is in scope — this
/// exists so `ExecutionSandbox` can be built against a container
/// backend without a code change, and fails every call with
/// [`SandboxError::RuntimeUnavailable`] until one is wired in.
#[derive(Default)]
pub struct ContainerRuntime;

#[async_trait]
impl Runtime for ContainerRuntime {
    async fn prepare(&self, _task: &Task) -> Result<RuntimeHandle, SandboxError> {
        Err(SandboxError::RuntimeUnavailable("container runtime not implemented".into()))
    }

    async fn run(&self, _handle: &RuntimeHandle, _task: &Task) -> Result<(String, i32), SandboxError> {
        Err(SandboxError::RuntimeUnavailable("container runtime not implemented".into()))
    }

    async fn kill(&self, _handle: &RuntimeHandle) -> Result<(), SandboxError> {
        Err(SandboxError::RuntimeUnavailable("container runtime not implemented".into()))
    }

    async fn cleanup(&self, _handle: &RuntimeHandle) -> Result<(), SandboxError> {
        Err(SandboxError::RuntimeUnavailable("container runtime not implemented".into()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub memory_cap_mb: u32,
    pub cpu_cap_cores: u32,
    pub timeout_cap_s: u32,
    pub network_allowed: bool,
}

pub struct ExecutionSandbox {
    runtime: Box<dyn Runtime>,
    limits: SandboxLimits,
    /// Runtime handle for each task currently executing, so a
    /// cancellation request can be routed to the right process.
    running: Mutex<HashMap<TaskId, RuntimeHandle>>,
    /// Tasks a `cancel` call has targeted but whose `run` future hasn't
    /// observed the kill yet; consulted once `run` returns so the exit
    /// result is reported as `cancelled` rather than a bare failure.
    cancelled: Mutex<HashSet<TaskId>>,
}

impl ExecutionSandbox {
    pub fn new(runtime: Box<dyn Runtime>, limits: SandboxLimits) -> Self {
        Self {
            runtime,
            limits,
            running: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
        }
    }

    /// Validates caps, prepares the environment, runs the task, and
    /// always reclaims the environment on every exit path (§4.8).
    pub async fn execute(&self, task: &Task, node_id: duxnet_core::NodeId) -> TaskResult {
        let start = Instant::now();

        if let Err(reason) = self.validate(task) {
            return self.failure_result(task, node_id, reason, start.elapsed());
        }

        let handle = match self.runtime.prepare(task).await {
            Ok(h) => h,
            Err(e) => return self.failure_result(task, node_id, e.to_string(), start.elapsed()),
        };

        self.running.lock().insert(task.task_id, handle);
        let run_result = self.runtime.run(&handle, task).await;
        self.running.lock().remove(&task.task_id);
        let _ = self.runtime.cleanup(&handle).await;
        let was_cancelled = self.cancelled.lock().remove(&task.task_id);

        if was_cancelled {
            return self.cancelled_result(task, node_id, start.elapsed());
        }

        match run_result {
            Ok((stdout, exit_code)) => self.build_result(task, node_id, stdout, exit_code, start.elapsed()),
            Err(SandboxError::RuntimeUnavailable(msg)) if msg.contains("timeout") => {
                self.timeout_result(task, node_id, start.elapsed())
            }
            Err(e) => self.failure_result(task, node_id, e.to_string(), start.elapsed()),
        }
    }

    /// Instructs the runtime to kill the process backing `task_id`, if
    /// it is currently executing in this sandbox (SIGTERM then SIGKILL
    /// after the runtime's grace period). Returns `true` when a running
    /// task was found and a kill was issued; the in-flight `execute`
    /// call reports the task as `cancelled` once the kill completes.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        let handle = self.running.lock().get(&task_id).copied();
        match handle {
            Some(handle) => {
                self.cancelled.lock().insert(task_id);
                let _ = self.runtime.kill(&handle).await;
                true
            }
            None => false,
        }
    }

    fn validate(&self, task: &Task) -> Result<(), String> {
        task.validate()?;
        if task.memory_mb > self.limits.memory_cap_mb {
            return Err("task memory request exceeds sandbox cap".into());
        }
        if task.timeout_seconds > self.limits.timeout_cap_s {
            return Err("task timeout request exceeds sandbox cap".into());
        }
        Ok(())
    }

    fn build_result(
        &self,
        task: &Task,
        node_id: duxnet_core::NodeId,
        stdout: String,
        exit_code: i32,
        elapsed: Duration,
    ) -> TaskResult {
        let output_data = match serde_json::from_str::<serde_json::Value>(stdout.trim()) {
            Ok(serde_json::Value::Object(map)) => map,
            Ok(other) => {
                let mut map = serde_json::Map::new();
                map.insert("result".to_string(), other);
                map
            }
            Err(_) => {
                let mut map = serde_json::Map::new();
                map.insert("result".to_string(), serde_json::Value::String(stdout));
                map
            }
        };
        let result_hash = sorted_json_hash(&serde_json::Value::Object(output_data.clone()));
        let status = if exit_code == 0 { TaskStatus::Completed } else { TaskStatus::Failed };

        if status == TaskStatus::Failed {
            warn!(task_id = %task.task_id, exit_code, "task exited non-zero");
        } else {
            info!(task_id = %task.task_id, "task completed");
        }

        TaskResult {
            task_id: task.task_id,
            node_id,
            status,
            output_data,
            error_message: if status == TaskStatus::Failed {
                Some(format!("exit code {exit_code}"))
            } else {
                None
            },
            execution_time_seconds: elapsed.as_secs_f64(),
            memory_used_mb: 0,
            cpu_usage_percent: 0.0,
            result_hash,
            signature: None,
            verified: false,
            created_at: now(),
        }
    }

    fn failure_result(
        &self,
        task: &Task,
        node_id: duxnet_core::NodeId,
        reason: String,
        elapsed: Duration,
    ) -> TaskResult {
        TaskResult {
            task_id: task.task_id,
            node_id,
            status: TaskStatus::Failed,
            output_data: serde_json::Map::new(),
            error_message: Some(reason),
            execution_time_seconds: elapsed.as_secs_f64(),
            memory_used_mb: 0,
            cpu_usage_percent: 0.0,
            result_hash: sorted_json_hash(&serde_json::json!({})),
            signature: None,
            verified: false,
            created_at: now(),
        }
    }

    fn timeout_result(&self, task: &Task, node_id: duxnet_core::NodeId, elapsed: Duration) -> TaskResult {
        TaskResult {
            task_id: task.task_id,
            node_id,
            status: TaskStatus::Timeout,
            output_data: serde_json::Map::new(),
            error_message: Some("wall-clock timeout exceeded".into()),
            execution_time_seconds: elapsed.as_secs_f64(),
            memory_used_mb: 0,
            cpu_usage_percent: 0.0,
            result_hash: sorted_json_hash(&serde_json::json!({})),
            signature: None,
            verified: false,
            created_at: now(),
        }
    }

    fn cancelled_result(&self, task: &Task, node_id: duxnet_core::NodeId, elapsed: Duration) -> TaskResult {
        TaskResult {
            task_id: task.task_id,
            node_id,
            status: TaskStatus::Cancelled,
            output_data: serde_json::Map::new(),
            error_message: Some("task cancelled".into()),
            execution_time_seconds: elapsed.as_secs_f64(),
            memory_used_mb: 0,
            cpu_usage_percent: 0.0,
            result_hash: sorted_json_hash(&serde_json::json!({})),
            signature: None,
            verified: false,
            created_at: now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(code: &str) -> Task {
        Task {
            task_id: Uuid::new_v4(),
            service_name: "svc".into(),
            task_type: "generic".into(),
            code: code.into(),
            parameters: serde_json::Map::new(),
            input_data: None,
            cpu_cores: 1,
            memory_mb: 256,
            timeout_seconds: 30,
            payment_amount: 0,
            priority: 3,
            status: TaskStatus::Pending,
            assigned_node_id: None,
            escrow_id: None,
            created_at: now(),
            retry_count: 0,
        }
    }

    fn limits() -> SandboxLimits {
        SandboxLimits {
            memory_cap_mb: 1024,
            cpu_cap_cores: 4,
            timeout_cap_s: 60,
            network_allowed: false,
        }
    }

    #[tokio::test]
    async fn empty_code_fails_validation_before_running() {
        let sandbox = ExecutionSandbox::new(Box::new(NativeRuntime::default()), limits());
        let result = sandbox.execute(&task(""), Uuid::new_v4()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.unwrap().contains("code must not be empty"));
    }

    #[tokio::test]
    async fn over_cap_memory_request_fails_before_running() {
        let sandbox = ExecutionSandbox::new(Box::new(NativeRuntime::default()), limits());
        let mut t = task("print(1)");
        t.memory_mb = 8192;
        let result = sandbox.execute(&t, Uuid::new_v4()).await;
        assert_eq!(result.status, TaskStatus::Failed);
    }

    /// A `Runtime` whose `run` blocks until `kill` is called, standing
    /// in for a long-running process under test without spawning a
    /// real interpreter.
    struct BlockingRuntime {
        killed: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Runtime for BlockingRuntime {
        async fn prepare(&self, _task: &Task) -> Result<RuntimeHandle, SandboxError> {
            Ok(RuntimeHandle { id: Uuid::new_v4() })
        }

        async fn run(&self, _handle: &RuntimeHandle, _task: &Task) -> Result<(String, i32), SandboxError> {
            self.killed.notified().await;
            Err(SandboxError::RuntimeUnavailable("killed".into()))
        }

        async fn kill(&self, _handle: &RuntimeHandle) -> Result<(), SandboxError> {
            self.killed.notify_one();
            Ok(())
        }

        async fn cleanup(&self, _handle: &RuntimeHandle) -> Result<(), SandboxError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn cancelling_a_running_task_reports_cancelled_status() {
        let killed = Arc::new(tokio::sync::Notify::new());
        let sandbox = Arc::new(ExecutionSandbox::new(
            Box::new(BlockingRuntime { killed: killed.clone() }),
            limits(),
        ));
        let t = task("loop{}");
        let task_id = t.task_id;

        let exec_sandbox = sandbox.clone();
        let handle = tokio::spawn(async move { exec_sandbox.execute(&t, Uuid::new_v4()).await });

        // Give `execute` a chance to register the task as running.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(sandbox.cancel(task_id).await);
        let result = handle.await.unwrap();
        assert_eq!(result.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_an_unknown_task_is_a_noop() {
        let sandbox = ExecutionSandbox::new(Box::new(NativeRuntime::default()), limits());
        assert!(!sandbox.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn container_runtime_reports_unavailable() {
        let sandbox = ExecutionSandbox::new(Box::new(ContainerRuntime), limits());
        let result = sandbox.execute(&task("print(1)"), Uuid::new_v4()).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.unwrap().contains("container runtime not implemented"));
    }
}

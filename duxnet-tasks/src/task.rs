//! Shared task/result types for the scheduler, sandbox, and verifier.

use duxnet_core::{EscrowId, Money, NodeId, TaskId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub service_name: String,
    pub task_type: String,
    pub code: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub input_data: Option<serde_json::Value>,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub timeout_seconds: u32,
    pub payment_amount: Money,
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_node_id: Option<NodeId>,
    pub escrow_id: Option<EscrowId>,
    pub created_at: Timestamp,
    pub retry_count: u32,
}

impl Task {
    pub fn validate(&self) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("code must not be empty".into());
        }
        if self.cpu_cores < 1 {
            return Err("cpu_cores must be >= 1".into());
        }
        if !(128..=8192).contains(&self.memory_mb) {
            return Err("memory_mb must be within [128, 8192]".into());
        }
        if !(30..=3600).contains(&self.timeout_seconds) {
            return Err("timeout_seconds must be within [30, 3600]".into());
        }
        if !(1..=5).contains(&self.priority) {
            return Err("priority must be within [1, 5]".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub status: TaskStatus,
    pub output_data: serde_json::Map<String, serde_json::Value>,
    pub error_message: Option<String>,
    pub execution_time_seconds: f64,
    pub memory_used_mb: u32,
    pub cpu_usage_percent: f64,
    pub result_hash: String,
    pub signature: Option<String>,
    pub verified: bool,
    pub created_at: Timestamp,
}

/// Runtime view of a node's scheduling-relevant attributes, derived
/// from registry rows (§3, "NodeCapability").
#[derive(Debug, Clone)]
pub struct NodeCapability {
    pub node_id: NodeId,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub storage_gb: u32,
    pub gpu: bool,
    pub supported_services: HashMap<String, ()>,
    pub reputation: f64,
    pub success_rate: f64,
    pub avg_execution_time: f64,
    pub current_assignments: u32,
}

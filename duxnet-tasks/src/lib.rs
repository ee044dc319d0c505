//! C10 Task Scheduler, C11 Execution Sandbox, and C12 Result Verifier.

pub mod sandbox;
pub mod scheduler;
pub mod task;
pub mod verifier;

pub use sandbox::{ContainerRuntime, ExecutionSandbox, NativeRuntime, Runtime, RuntimeHandle, SandboxError, SandboxLimits};
pub use scheduler::{Assignment, SchedulerConfig, SchedulingMetrics, TaskScheduler, TickOutcome};
pub use task::{NodeCapability, Task, TaskResult, TaskStatus};
pub use verifier::{
    CustomRule, FieldType, ResultVerifier, ServiceHook, VerificationFailure, VerificationRule, VerificationStats,
};

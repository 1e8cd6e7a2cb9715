use std::sync::Arc;

use bytes::Bytes;
use gearshift_core::{GearshiftError, Priority, Result, Task};
use gearshift_protocol::PacketType;
use tracing::{info, warn};

use crate::client::{DispatchOutcome, JobRequest, TaskBatch};
use crate::error::BrokerError;
use crate::registry::ConnectionRegistry;

/// The six Gearman submit calls, one per priority and background pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchOp {
    Normal,
    NormalBackground,
    High,
    HighBackground,
    Low,
    LowBackground,
}

impl DispatchOp {
    pub const fn resolve(priority: Priority, background: bool) -> Self {
        match (priority, background) {
            (Priority::High, false) => DispatchOp::High,
            (Priority::High, true) => DispatchOp::HighBackground,
            (Priority::Normal, false) => DispatchOp::Normal,
            (Priority::Normal, true) => DispatchOp::NormalBackground,
            (Priority::Low, false) => DispatchOp::Low,
            (Priority::Low, true) => DispatchOp::LowBackground,
        }
    }

    pub fn for_task(task: &Task) -> Self {
        Self::resolve(task.priority(), task.is_background())
    }

    pub const fn packet_type(self) -> PacketType {
        match self {
            DispatchOp::Normal => PacketType::SubmitJob,
            DispatchOp::NormalBackground => PacketType::SubmitJobBg,
            DispatchOp::High => PacketType::SubmitJobHigh,
            DispatchOp::HighBackground => PacketType::SubmitJobHighBg,
            DispatchOp::Low => PacketType::SubmitJobLow,
            DispatchOp::LowBackground => PacketType::SubmitJobLowBg,
        }
    }

    pub const fn is_background(self) -> bool {
        matches!(
            self,
            DispatchOp::NormalBackground | DispatchOp::HighBackground | DispatchOp::LowBackground
        )
    }
}

/// Result of dispatching the tasks of one connection.
#[derive(Debug)]
pub struct GroupReport {
    pub connection: String,
    pub task_ids: Vec<String>,
    pub result: Result<Vec<DispatchOutcome>>,
}

/// Per-connection results of one `dispatch_batch` call, in order of each
/// connection's first appearance in the input.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub groups: Vec<GroupReport>,
}

impl BatchReport {
    /// Number of tasks the broker accepted.
    pub fn dispatched(&self) -> usize {
        self.groups
            .iter()
            .filter_map(|g| g.result.as_ref().ok())
            .map(Vec::len)
            .sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&GroupReport, &GearshiftError)> {
        self.groups
            .iter()
            .filter_map(|g| g.result.as_ref().err().map(|e| (g, e)))
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &DispatchOutcome> {
        self.groups
            .iter()
            .filter_map(|g| g.result.as_ref().ok())
            .flatten()
    }
}

fn transport(connection: &str, err: BrokerError) -> GearshiftError {
    GearshiftError::Transport {
        connection: connection.to_string(),
        reason: err.to_string(),
    }
}

fn job_request(task: &Task) -> JobRequest {
    JobRequest::new(
        task.capability(),
        task.id(),
        Bytes::copy_from_slice(task.payload()),
    )
}

/// Turns tasks into broker calls.
pub struct DispatchRouter {
    registry: Arc<ConnectionRegistry>,
}

impl DispatchRouter {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Reject a task that could never be dispatched. No I/O.
    pub fn validate(&self, task: &Task) -> Result<()> {
        if task.capability().is_empty() {
            return Err(GearshiftError::config(format!(
                "Task '{}' has no capability to dispatch",
                task.id()
            )));
        }
        if !self.registry.is_configured(task.connection_name()) {
            return Err(GearshiftError::config(format!(
                "Can't create client '{}'. Connection configuration is missing.",
                task.connection_name()
            )));
        }
        Ok(())
    }

    /// Validate and dispatch a single task with one broker call.
    pub async fn dispatch_one(&self, task: &Task) -> Result<DispatchOutcome> {
        self.validate(task)?;
        let connection = task.connection_name();
        let client = self.registry.get(connection)?;
        let outcome = client
            .submit(DispatchOp::for_task(task), &job_request(task))
            .await
            .map_err(|e| transport(connection, e))?;
        info!(task_id = %task.id(), %connection, handle = %outcome.handle, "task dispatched");
        Ok(outcome)
    }

    /// Dispatch `tasks` with one `run_tasks` call per connection.
    ///
    /// Every task is validated before any broker call. A transport failure
    /// is recorded in that connection's group and the remaining groups are
    /// still dispatched.
    pub async fn dispatch_batch(&self, tasks: &[Task]) -> Result<BatchReport> {
        for task in tasks {
            self.validate(task)?;
        }

        let mut groups: Vec<(&str, Vec<&Task>)> = Vec::new();
        for task in tasks {
            match groups
                .iter_mut()
                .find(|(name, _)| *name == task.connection_name())
            {
                Some((_, members)) => members.push(task),
                None => groups.push((task.connection_name(), vec![task])),
            }
        }

        let mut report = BatchReport::default();
        for (connection, members) in groups {
            let task_ids: Vec<String> = members.iter().map(|t| t.id().to_string()).collect();
            let client = self.registry.get(connection)?;

            let mut batch = TaskBatch::new();
            for task in &members {
                batch.enqueue(DispatchOp::for_task(task), job_request(task));
            }

            let result = client
                .run_tasks(batch)
                .await
                .map_err(|e| transport(connection, e));
            match &result {
                Ok(outcomes) => {
                    info!(%connection, count = outcomes.len(), "batch dispatched")
                }
                Err(e) => warn!(%connection, count = task_ids.len(), err = %e, "batch dispatch failed"),
            }
            report.groups.push(GroupReport {
                connection: connection.to_string(),
                task_ids,
                result,
            });
        }
        Ok(report)
    }
}

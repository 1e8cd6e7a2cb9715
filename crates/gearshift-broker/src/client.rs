use async_trait::async_trait;
use bytes::Bytes;

use crate::dispatch::DispatchOp;
use crate::error::BrokerError;

/// One job as the broker sees it. `unique_id` is the task id, so the job
/// server can coalesce duplicate submissions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub capability: String,
    pub unique_id: String,
    pub payload: Bytes,
}

impl JobRequest {
    pub fn new(
        capability: impl Into<String>,
        unique_id: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            capability: capability.into(),
            unique_id: unique_id.into(),
            payload: payload.into(),
        }
    }
}

/// Jobs collected for a single `run_tasks` round-trip, in submission order.
#[derive(Debug, Clone, Default)]
pub struct TaskBatch {
    jobs: Vec<(DispatchOp, JobRequest)>,
}

impl TaskBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, op: DispatchOp, job: JobRequest) -> &mut Self {
        self.jobs.push((op, job));
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> &[(DispatchOp, JobRequest)] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<(DispatchOp, JobRequest)> {
        self.jobs
    }
}

/// How a submitted job ended up, as far as the caller waited for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Accepted by the job server; a background job is never waited on.
    Queued,
    /// Foreground job finished; carries the worker's result data.
    Complete(Vec<u8>),
    /// The worker reported `WORK_FAIL`.
    Failed,
    /// The worker reported `WORK_EXCEPTION` with this message.
    Exception(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub unique_id: String,
    /// Job handle assigned by the job server (`H:host:n`).
    pub handle: String,
    pub status: DispatchStatus,
}

/// A handle on one named connection to the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Connection name this client was built for.
    fn name(&self) -> &str;

    /// Issue a single submit call.
    async fn submit(&self, op: DispatchOp, job: &JobRequest)
        -> Result<DispatchOutcome, BrokerError>;

    /// Submit every job in `batch` in one round-trip. Outcomes come back in
    /// submission order.
    async fn run_tasks(&self, batch: TaskBatch) -> Result<Vec<DispatchOutcome>, BrokerError>;
}

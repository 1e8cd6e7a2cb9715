use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

pub const EXAMPLE_JOB: &str = "gearshift.example";
pub const DIE_JOB: &str = "gearshift.diejob";

/// How a job run can go wrong. Each maps to a different worker reply.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    /// Answered with `WORK_FAIL`.
    #[error("job failed")]
    Failed,

    /// Answered with `WORK_EXCEPTION`.
    #[error("job raised an exception: {0}")]
    Exception(String),

    /// Answered with `WORK_FAIL`, then the worker stops.
    #[error("fatal job error: {0}")]
    Fatal(String),
}

/// Code that runs one capability on the worker side.
#[async_trait]
pub trait Job: Send + Sync {
    /// Capability name announced to the job server.
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, JobError>;
}

/// Capability name to job implementation.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<String, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the jobs shipped with gearshift.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ExampleJob).register(DieJob);
        registry
    }

    pub fn register(&mut self, job: impl Job + 'static) -> &mut Self {
        self.jobs.insert(job.name().to_string(), Arc::new(job));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Job>> {
        self.jobs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }
}

/// Logs the payload and echoes it back.
#[derive(Debug, Default)]
pub struct ExampleJob;

#[async_trait]
impl Job for ExampleJob {
    fn name(&self) -> &str {
        EXAMPLE_JOB
    }

    fn description(&self) -> &str {
        "Logs and echoes its payload"
    }

    async fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, JobError> {
        info!(
            job = EXAMPLE_JOB,
            payload = %String::from_utf8_lossy(payload),
            "example job executed"
        );
        Ok(payload.to_vec())
    }
}

/// Fails on request: payload `exception`, `error` or `die`.
#[derive(Debug, Default)]
pub struct DieJob;

#[async_trait]
impl Job for DieJob {
    fn name(&self) -> &str {
        DIE_JOB
    }

    fn description(&self) -> &str {
        "Fails in the way its payload asks for"
    }

    async fn execute(&self, payload: &[u8]) -> Result<Vec<u8>, JobError> {
        match payload {
            b"exception" => Err(JobError::Exception("exception requested".to_string())),
            b"error" => Err(JobError::Failed),
            b"die" => Err(JobError::Fatal("die requested".to_string())),
            _ => Ok(b"survived".to_vec()),
        }
    }
}

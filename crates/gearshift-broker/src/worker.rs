use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use gearshift_core::config::{ConnectionConfig, WorkerConfig};
use gearshift_core::{GearshiftConfig, GearshiftError, Result};
use gearshift_protocol::{Packet, PacketType};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::gearman::{connect_first, next_packet, server_error, Connection};
use crate::jobs::{Job, JobError, JobRegistry};

/// Read-only description of a configured worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub description: Option<String>,
    pub connection: String,
    pub timeout_ms: Option<u64>,
    pub servers: String,
    /// `(capability, job description)` pairs.
    pub capabilities: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    Idle,
}

/// How a worker run ended when it ended cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub jobs_run: u64,
    pub reason: ExitReason,
}

/// Pulls jobs for its configured capabilities from one connection and runs
/// them.
pub struct Worker {
    name: String,
    config: WorkerConfig,
    connection: ConnectionConfig,
    jobs: Vec<Arc<dyn Job>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("connection", &self.config.connection)
            .field("capabilities", &self.config.capabilities)
            .finish()
    }
}

impl Worker {
    /// Bind a worker profile to its connection. Every capability must be
    /// registered in `registry`.
    pub fn new(
        name: impl Into<String>,
        config: &WorkerConfig,
        connection: &ConnectionConfig,
        registry: &JobRegistry,
    ) -> Result<Self> {
        let name = name.into();
        let jobs = config
            .capabilities
            .iter()
            .map(|capability| {
                registry.get(capability).ok_or_else(|| {
                    GearshiftError::config(format!(
                        "Capability '{capability}' requested by worker '{name}' is not registered"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name,
            config: config.clone(),
            connection: connection.clone(),
            jobs,
        })
    }

    /// Resolve the worker profile `name` and its connection from `config`.
    pub fn from_config(
        config: &GearshiftConfig,
        name: &str,
        registry: &JobRegistry,
    ) -> Result<Self> {
        let (worker, connection) = config.worker(name)?;
        Self::new(name, worker, connection, registry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            name: self.name.clone(),
            description: self.config.description.clone(),
            connection: self.config.connection.clone(),
            timeout_ms: self.connection.timeout_ms,
            servers: self.connection.servers(),
            capabilities: self
                .jobs
                .iter()
                .map(|job| (job.name().to_string(), job.description().to_string()))
                .collect(),
        }
    }

    fn job(&self, capability: &[u8]) -> Option<&Arc<dyn Job>> {
        self.jobs
            .iter()
            .find(|job| job.name().as_bytes() == capability)
    }

    /// Run until shutdown, idle timeout, a fatal job or a transport error.
    pub async fn run(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> std::result::Result<WorkerExit, BrokerError> {
        let mut conn = connect_first(&self.connection.endpoints).await?;
        for job in &self.jobs {
            conn.feed(Packet::can_do(job.name())).await?;
        }
        conn.flush().await?;
        info!(worker = %self.name, servers = %self.connection.servers(), "worker started");

        let idle_limit = self.config.idle_timeout_ms.map(Duration::from_millis);
        let mut last_job = Instant::now();
        let mut jobs_run = 0u64;

        loop {
            conn.send(Packet::grab_job()).await?;

            let packet = tokio::select! {
                packet = next_packet(&mut conn) => packet?,
                _ = shutdown.changed() => {
                    info!(worker = %self.name, jobs_run, "worker shutting down");
                    return Ok(WorkerExit { jobs_run, reason: ExitReason::Shutdown });
                }
            };

            match packet.kind {
                PacketType::JobAssign => {
                    self.handle_assignment(&mut conn, &packet).await?;
                    jobs_run += 1;
                    last_job = Instant::now();
                }
                PacketType::NoJob => {
                    conn.send(Packet::pre_sleep()).await?;
                    let idle = async {
                        match idle_limit {
                            Some(limit) => tokio::time::sleep_until(last_job + limit).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        woken = wait_for_noop(&mut conn) => woken?,
                        _ = idle => {
                            info!(worker = %self.name, jobs_run, "worker idle, exiting");
                            return Ok(WorkerExit { jobs_run, reason: ExitReason::Idle });
                        }
                        _ = shutdown.changed() => {
                            info!(worker = %self.name, jobs_run, "worker shutting down");
                            return Ok(WorkerExit { jobs_run, reason: ExitReason::Shutdown });
                        }
                    }
                }
                PacketType::Noop => {}
                PacketType::Error => return Err(server_error(&packet)),
                kind => return Err(BrokerError::UnexpectedPacket { kind }),
            }
        }
    }

    async fn handle_assignment(
        &self,
        conn: &mut Connection,
        packet: &Packet,
    ) -> std::result::Result<(), BrokerError> {
        let handle: &Bytes = &packet.args[0];
        let capability = &packet.args[1];
        let payload = &packet.args[2];

        let Some(job) = self.job(capability) else {
            warn!(
                worker = %self.name,
                capability = %String::from_utf8_lossy(capability),
                "assigned a capability this worker does not run"
            );
            conn.send(Packet::work_fail(handle)).await?;
            return Ok(());
        };

        debug!(worker = %self.name, job = %job.name(), "job assigned");
        match job.execute(payload).await {
            Ok(result) => conn.send(Packet::work_complete(handle, result)).await?,
            Err(JobError::Failed) => {
                warn!(worker = %self.name, job = %job.name(), "job failed");
                conn.send(Packet::work_fail(handle)).await?;
            }
            Err(JobError::Exception(message)) => {
                warn!(worker = %self.name, job = %job.name(), %message, "job raised an exception");
                conn.send(Packet::work_exception(handle, &message)).await?;
            }
            Err(JobError::Fatal(reason)) => {
                error!(worker = %self.name, job = %job.name(), %reason, "fatal job error");
                conn.send(Packet::work_fail(handle)).await?;
                return Err(BrokerError::JobAborted {
                    job: job.name().to_string(),
                    reason,
                });
            }
        }
        Ok(())
    }
}

/// After `PRE_SLEEP` the server sends `NOOP` once work may be available.
async fn wait_for_noop(conn: &mut Connection) -> std::result::Result<(), BrokerError> {
    loop {
        let packet = next_packet(conn).await?;
        match packet.kind {
            PacketType::Noop => return Ok(()),
            PacketType::Error => return Err(server_error(&packet)),
            kind => debug!(?kind, "ignoring packet while asleep"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DIE_JOB, EXAMPLE_JOB};

    fn profile(capabilities: &[&str]) -> WorkerConfig {
        WorkerConfig {
            connection: "default".to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            description: Some("Example worker".to_string()),
            idle_timeout_ms: None,
        }
    }

    #[test]
    fn unregistered_capability_is_rejected() {
        let err = Worker::new(
            "example",
            &profile(&[EXAMPLE_JOB, "reports.render"]),
            &ConnectionConfig::default(),
            &JobRegistry::builtin(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(err.to_string().contains("'reports.render'"));
    }

    #[test]
    fn info_lists_connection_and_capabilities() {
        let connection = ConnectionConfig {
            timeout_ms: Some(1500),
            ..ConnectionConfig::default()
        };
        let worker = Worker::new(
            "example",
            &profile(&[EXAMPLE_JOB, DIE_JOB]),
            &connection,
            &JobRegistry::builtin(),
        )
        .unwrap();

        let info = worker.info();
        assert_eq!(info.name, "example");
        assert_eq!(info.connection, "default");
        assert_eq!(info.timeout_ms, Some(1500));
        assert_eq!(info.servers, "127.0.0.1:4730");
        assert_eq!(info.capabilities[0].0, EXAMPLE_JOB);
        assert_eq!(info.capabilities[1].0, DIE_JOB);
    }
}

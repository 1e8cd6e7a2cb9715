use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use gearshift_core::config::{ConnectionConfig, Endpoint};
use gearshift_protocol::{GearmanCodec, Packet, PacketType};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::client::{BrokerClient, DispatchOutcome, DispatchStatus, JobRequest, TaskBatch};
use crate::dispatch::DispatchOp;
use crate::error::BrokerError;

pub(crate) type Connection = Framed<TcpStream, GearmanCodec>;

/// Open a framed connection to the first endpoint that accepts one.
pub(crate) async fn connect_first(endpoints: &[Endpoint]) -> Result<Connection, BrokerError> {
    for endpoint in endpoints {
        match TcpStream::connect((endpoint.host.as_str(), endpoint.port)).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(server = %endpoint, "connected to job server");
                return Ok(Framed::new(stream, GearmanCodec::new()));
            }
            Err(e) => warn!(server = %endpoint, err = %e, "job server unreachable"),
        }
    }
    Err(BrokerError::Unreachable {
        servers: endpoints
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    })
}

/// Next packet from the server; a closed socket is an error here.
pub(crate) async fn next_packet(conn: &mut Connection) -> Result<Packet, BrokerError> {
    match conn.next().await {
        Some(Ok(packet)) => Ok(packet),
        Some(Err(e)) => Err(e.into()),
        None => Err(BrokerError::Closed),
    }
}

pub(crate) fn server_error(packet: &Packet) -> BrokerError {
    let text = |i: usize| {
        packet
            .arg(i)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    };
    BrokerError::Server {
        code: text(0),
        message: text(1),
    }
}

/// Gearman client over one persistent TCP connection.
///
/// The connection is opened lazily, to the first reachable endpoint in
/// configuration order, and dropped after any failure so the next call
/// starts clean.
pub struct GearmanClient {
    name: String,
    endpoints: Vec<Endpoint>,
    timeout: Option<Duration>,
    conn: Mutex<Option<Connection>>,
}

impl GearmanClient {
    pub fn new(name: impl Into<String>, config: &ConnectionConfig) -> Self {
        Self {
            name: name.into(),
            endpoints: config.endpoints.clone(),
            timeout: config.timeout(),
            conn: Mutex::new(None),
        }
    }

    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, BrokerError>
    where
        F: Future<Output = Result<T, BrokerError>>,
    {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| BrokerError::Timeout {
                    ms: limit.as_millis() as u64,
                })?,
            None => fut.await,
        }
    }

    async fn exchange(
        &self,
        jobs: &[(DispatchOp, JobRequest)],
    ) -> Result<Vec<DispatchOutcome>, BrokerError> {
        let mut guard = self.conn.lock().await;
        let result = self
            .with_timeout(async {
                if guard.is_none() {
                    *guard = Some(open(&self.endpoints).await?);
                }
                match guard.as_mut() {
                    Some(conn) => submit_all(conn, jobs).await,
                    None => Err(BrokerError::Closed),
                }
            })
            .await;
        if let Err(e) = &result {
            warn!(connection = %self.name, err = %e, "dropping job server connection");
            *guard = None;
        }
        result
    }
}

/// Connect and ask the server to forward worker exceptions to us.
async fn open(endpoints: &[Endpoint]) -> Result<Connection, BrokerError> {
    let mut conn = connect_first(endpoints).await?;
    conn.send(Packet::request(
        PacketType::OptionReq,
        vec![Bytes::from_static(b"exceptions")],
    ))
    .await?;
    let reply = next_packet(&mut conn).await?;
    match reply.kind {
        PacketType::OptionRes => Ok(conn),
        PacketType::Error => Err(server_error(&reply)),
        kind => Err(BrokerError::UnexpectedPacket { kind }),
    }
}

/// Pipeline every submit, then read replies until each job has a handle and
/// every foreground job has finished. `JOB_CREATED` replies arrive in
/// submission order on a single connection.
async fn submit_all(
    conn: &mut Connection,
    jobs: &[(DispatchOp, JobRequest)],
) -> Result<Vec<DispatchOutcome>, BrokerError> {
    for (op, job) in jobs {
        conn.feed(Packet::submit(
            op.packet_type(),
            &job.capability,
            &job.unique_id,
            job.payload.clone(),
        ))
        .await?;
    }
    conn.flush().await?;

    let mut outcomes: Vec<DispatchOutcome> = Vec::with_capacity(jobs.len());
    // handle -> (outcome index, data streamed so far)
    let mut waiting: HashMap<Bytes, (usize, Vec<u8>)> = HashMap::new();

    while outcomes.len() < jobs.len() || !waiting.is_empty() {
        let packet = next_packet(conn).await?;
        match packet.kind {
            PacketType::JobCreated if outcomes.len() < jobs.len() => {
                let handle = packet.args[0].clone();
                let (op, job) = &jobs[outcomes.len()];
                if !op.is_background() {
                    waiting.insert(handle.clone(), (outcomes.len(), Vec::new()));
                }
                outcomes.push(DispatchOutcome {
                    unique_id: job.unique_id.clone(),
                    handle: String::from_utf8_lossy(&handle).into_owned(),
                    status: DispatchStatus::Queued,
                });
            }
            PacketType::WorkData => {
                if let Some((_, data)) = waiting.get_mut(&packet.args[0]) {
                    data.extend_from_slice(&packet.args[1]);
                }
            }
            PacketType::WorkWarning | PacketType::WorkStatus => {}
            PacketType::WorkComplete | PacketType::WorkFail | PacketType::WorkException => {
                let Some((index, mut data)) = waiting.remove(&packet.args[0]) else {
                    continue;
                };
                outcomes[index].status = match packet.kind {
                    PacketType::WorkComplete => {
                        data.extend_from_slice(&packet.args[1]);
                        DispatchStatus::Complete(data)
                    }
                    PacketType::WorkException => DispatchStatus::Exception(
                        String::from_utf8_lossy(&packet.args[1]).into_owned(),
                    ),
                    _ => DispatchStatus::Failed,
                };
            }
            PacketType::Error => return Err(server_error(&packet)),
            kind => return Err(BrokerError::UnexpectedPacket { kind }),
        }
    }
    Ok(outcomes)
}

#[async_trait]
impl BrokerClient for GearmanClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(
        &self,
        op: DispatchOp,
        job: &JobRequest,
    ) -> Result<DispatchOutcome, BrokerError> {
        let mut outcomes = self.exchange(&[(op, job.clone())]).await?;
        let outcome = outcomes.pop().ok_or(BrokerError::Closed)?;
        info!(
            connection = %self.name,
            capability = %job.capability,
            handle = %outcome.handle,
            "job submitted"
        );
        Ok(outcome)
    }

    async fn run_tasks(&self, batch: TaskBatch) -> Result<Vec<DispatchOutcome>, BrokerError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let outcomes = self.exchange(batch.jobs()).await?;
        info!(connection = %self.name, count = outcomes.len(), "batch submitted");
        Ok(outcomes)
    }
}

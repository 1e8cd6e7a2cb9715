//! `gearshift-broker`: everything that talks to the Gearman job server.
//!
//! | Module       | Purpose                                                  |
//! |--------------|----------------------------------------------------------|
//! | `client`     | [`BrokerClient`] trait and the request/outcome types     |
//! | `gearman`    | [`GearmanClient`], the TCP implementation of the trait    |
//! | `registry`   | one cached client per named connection                   |
//! | `dispatch`   | priority/background → submit call, batching by connection |
//! | `jobs`       | worker-side [`Job`] trait and the built-in jobs          |
//! | `worker`     | `CAN_DO` / `GRAB_JOB` loop executing registered jobs     |

pub mod client;
pub mod dispatch;
pub mod error;
pub mod gearman;
pub mod jobs;
pub mod registry;
pub mod worker;

pub use client::{BrokerClient, DispatchOutcome, DispatchStatus, JobRequest, TaskBatch};
pub use dispatch::{BatchReport, DispatchOp, DispatchRouter, GroupReport};
pub use error::BrokerError;
pub use gearman::GearmanClient;
pub use jobs::{Job, JobError, JobRegistry};
pub use registry::{ClientFactory, ConnectionRegistry, GearmanClientFactory};
pub use worker::{ExitReason, Worker, WorkerExit, WorkerInfo};

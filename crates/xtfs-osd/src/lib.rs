#![warn(missing_docs)]

//! XtFS OSD subsystem: on-demand replica fetching
//!
//! When a read hits an object the local replica does not hold yet, the OSD
//! fetches it from another replica of the file. This crate picks which
//! replica to ask, retries across replicas on failure, shares one remote read
//! between concurrent callers, and writes fetched objects back locally.

pub mod config;
pub mod dissemination;
pub mod error;
pub mod object_io;
pub mod stage;
pub mod strategy;

pub use config::{DisseminationConfig, OsdReplicationConfig};
pub use dissemination::{
    DisseminationStats, FetchRequest, FetchResult, ObjectDissemination, ObjectStatus,
    ReadCompletion, Waiter, WaiterReceiver,
};
pub use error::{ReplicationError, ReplicationResult};
pub use object_io::{FetchedObject, LocalObjectStore, RemoteObjectReader};
pub use stage::{ReplicationHandle, ReplicationStage, StageMessage};
pub use strategy::{NextRequest, TransferStrategy};

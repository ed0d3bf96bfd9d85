//! Error types for the OSD replication subsystem.

use thiserror::Error;
use xtfs_common::{FileId, NodeId, XtfsError};

/// Result type alias for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur while fetching objects from other replicas.
///
/// The type is `Clone` because one failure is delivered to every request
/// waiting for the same object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Every candidate replica was tried and none could supply the object.
    #[error("no replica could supply object {file_id}:{object_no}")]
    NoReplicaAvailable {
        /// File the object belongs to.
        file_id: FileId,
        /// Object number.
        object_no: u64,
    },

    /// The remote node answered but does not store the object.
    #[error("object {file_id}:{object_no} not found on {node}")]
    ObjectNotFound {
        /// Node that was asked.
        node: NodeId,
        /// File the object belongs to.
        file_id: FileId,
        /// Object number.
        object_no: u64,
    },

    /// The remote read failed.
    #[error("read from {node} failed: {msg}")]
    ReadFailed {
        /// Node that was asked.
        node: NodeId,
        /// Description of the failure.
        msg: String,
    },

    /// The remote node could not be reached.
    #[error("OSD {node} unreachable")]
    NodeUnreachable {
        /// Node that could not be reached.
        node: NodeId,
    },

    /// The request carries an older replica set than the one in use.
    #[error("stale locations for {file_id}: request has version {requested}, current is {current}")]
    StaleLocations {
        /// File the request is for.
        file_id: FileId,
        /// Version carried by the request.
        requested: u64,
        /// Version currently used for the file.
        current: u64,
    },

    /// The replication stage was shut down before the request completed.
    #[error("replication stage shut down")]
    Shutdown,

    /// Configuration could not be loaded.
    #[error("configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// Invalid placement or topology data.
    #[error(transparent)]
    Common(#[from] XtfsError),
}

impl ReplicationError {
    /// Whether the failure says something about the node's reachability.
    ///
    /// A node that answered "not found" is healthy and is not backed off.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            ReplicationError::ReadFailed { .. } | ReplicationError::NodeUnreachable { .. }
        )
    }
}

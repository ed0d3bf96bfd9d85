//! Seams to the outside world: reading objects from remote OSDs and writing
//! fetched objects to the local object store.
//!
//! The transport and the storage layout live elsewhere; the replication core
//! only sees these two traits.

use async_trait::async_trait;
use bytes::Bytes;
use xtfs_common::{Capability, CowPolicy, FileId, Locations, NodeId};

use crate::error::ReplicationResult;

/// Object data returned by a remote OSD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedObject {
    /// Object contents.
    pub data: Bytes,
    /// `false` when the remote OSD detected a checksum mismatch on its copy.
    pub checksum_valid: bool,
    /// Objects the remote node stores, if the request asked for its object list.
    pub object_list: Option<Vec<u64>>,
}

impl FetchedObject {
    /// Object data with a valid checksum and no object list.
    pub fn valid(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            checksum_valid: true,
            object_list: None,
        }
    }

    /// Object data the remote OSD flagged as corrupt.
    pub fn corrupt(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            checksum_valid: false,
            object_list: None,
        }
    }
}

/// Reads single objects from remote OSDs.
#[async_trait]
pub trait RemoteObjectReader: Send + Sync + 'static {
    /// Read `object_no` of `file_id` from `node`.
    ///
    /// `capability` and `locations` are forwarded for authorization and view
    /// checks on the remote side. When `request_object_list` is set the remote
    /// node should also report which objects of the file it stores.
    async fn read_object(
        &self,
        node: &NodeId,
        file_id: &FileId,
        capability: &Capability,
        locations: &Locations,
        object_no: u64,
        request_object_list: bool,
    ) -> ReplicationResult<FetchedObject>;
}

/// Local object storage used to persist fetched objects.
pub trait LocalObjectStore: Send + Sync + 'static {
    /// Persist an object. Fire-and-forget: failures are handled by the store.
    fn write_object(
        &self,
        file_id: &FileId,
        object_no: u64,
        data: Bytes,
        locations: &Locations,
        cow_policy: CowPolicy,
    );

    /// Record that `object_no` lies in a sparse region of the file, so later
    /// reads find it locally as padding. The default does nothing.
    fn insert_padding_object(&self, _file_id: &FileId, _object_no: u64, _locations: &Locations) {}
}

//! Replica topology: which nodes hold which objects of a file.
//!
//! A [`Location`] is one replica: a striping policy plus the ordered list of
//! nodes the replica is striped over. [`Locations`] is the versioned set of
//! all replicas of a file as handed out by the metadata service.

use serde::{Deserialize, Serialize};

use crate::error::{XtfsError, XtfsResult};
use crate::striping::StripingPolicy;
use crate::types::NodeId;

/// How updates are propagated between the replicas of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaUpdatePolicy {
    /// The file is not replicated.
    #[default]
    None,
    /// Read-only replication: the file is sealed and replicas are filled on demand.
    ReadOnly,
    /// Write all, read one.
    WaR1,
    /// Write quorum, read quorum.
    WqRq,
}

/// Strategy a replica uses to pull missing objects from other replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStrategyKind {
    /// Random objects from random candidate nodes.
    #[default]
    Random,
    /// Objects in request order, candidate nodes round-robin.
    Simple,
}

/// Replication flags attached to a single replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaFlags {
    /// The replica holds every object of the file.
    pub complete: bool,
    /// The replica should be filled completely in the background, not only on demand.
    pub full_replica: bool,
    /// Strategy used when this replica fetches objects.
    pub strategy: Option<TransferStrategyKind>,
}

impl ReplicaFlags {
    /// Flags of a replica that already holds all objects.
    pub fn complete() -> Self {
        Self {
            complete: true,
            ..Self::default()
        }
    }
}

/// One replica of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    striping_policy: StripingPolicy,
    nodes: Vec<NodeId>,
    flags: ReplicaFlags,
    replica_update_policy: Option<ReplicaUpdatePolicy>,
}

impl Location {
    /// Create a replica striped over `nodes`.
    ///
    /// Fails with [`XtfsError::InvalidArgument`] unless there is exactly one
    /// node per stripe column.
    pub fn new(striping_policy: StripingPolicy, nodes: Vec<NodeId>) -> XtfsResult<Self> {
        let width = striping_policy.width() as usize;
        if nodes.len() != width {
            return Err(XtfsError::invalid_argument(format!(
                "replica lists {} nodes but its {} striping policy has width {}",
                nodes.len(),
                striping_policy.name(),
                width
            )));
        }
        Ok(Self {
            striping_policy,
            nodes,
            flags: ReplicaFlags::default(),
            replica_update_policy: None,
        })
    }

    /// Attach replication flags.
    pub fn with_flags(mut self, flags: ReplicaFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Striping policy of this replica.
    pub fn striping_policy(&self) -> &StripingPolicy {
        &self.striping_policy
    }

    /// Nodes in stripe column order.
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Replication flags.
    pub fn flags(&self) -> ReplicaFlags {
        self.flags
    }

    /// Update policy tag inherited from the replica set.
    pub fn replica_update_policy(&self) -> Option<ReplicaUpdatePolicy> {
        self.replica_update_policy
    }

    /// Tag the replica with the update policy of its replica set.
    pub fn set_replica_update_policy(&mut self, policy: ReplicaUpdatePolicy) {
        self.replica_update_policy = Some(policy);
    }

    /// Whether `node` is one of this replica's nodes.
    pub fn contains_node(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    /// Node storing `object`.
    pub fn node_for_object(&self, object: u64) -> &NodeId {
        &self.nodes[self.striping_policy.node_index_of(object)]
    }

    /// Node storing the byte at `offset`.
    pub fn node_for_offset(&self, offset: u64) -> &NodeId {
        self.node_for_object(self.striping_policy.object_of(offset))
    }

    /// Node storing all of `[first, last]`, if the range lies within one object.
    pub fn node_for_byte_range(&self, first: u64, last: u64) -> Option<&NodeId> {
        match self.striping_policy.objects_for_range(first, last).as_slice() {
            [single] => Some(&self.nodes[single.node_index]),
            _ => None,
        }
    }
}

/// Versioned set of all replicas of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    version: u64,
    replicas: Vec<Location>,
    replica_update_policy: ReplicaUpdatePolicy,
    sync_level: u32,
    read_only_file_size: u64,
}

impl Locations {
    /// Create a replica set. Every replica is tagged with `replica_update_policy`.
    pub fn new(
        version: u64,
        mut replicas: Vec<Location>,
        replica_update_policy: ReplicaUpdatePolicy,
        sync_level: u32,
    ) -> XtfsResult<Self> {
        if replicas.is_empty() {
            return Err(XtfsError::invalid_argument("a file needs at least one replica"));
        }
        for replica in &mut replicas {
            replica.set_replica_update_policy(replica_update_policy);
        }
        Ok(Self {
            version,
            replicas,
            replica_update_policy,
            sync_level,
            read_only_file_size: 0,
        })
    }

    /// Record the size of a sealed (read-only) file.
    pub fn with_read_only_file_size(mut self, size: u64) -> Self {
        self.read_only_file_size = size;
        self
    }

    /// Version of the replica set; grows with every change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All replicas.
    pub fn replicas(&self) -> &[Location] {
        &self.replicas
    }

    /// Update policy of the replica set.
    pub fn replica_update_policy(&self) -> ReplicaUpdatePolicy {
        self.replica_update_policy
    }

    /// Number of replicas a write has to reach before it is acknowledged.
    pub fn sync_level(&self) -> u32 {
        self.sync_level
    }

    /// File size recorded when the file was sealed.
    pub fn read_only_file_size(&self) -> u64 {
        self.read_only_file_size
    }

    /// Whether this replica set is a newer version than `other`.
    pub fn is_newer_than(&self, other: &Locations) -> bool {
        self.version > other.version
    }

    /// For every replica, the node that stores `object`.
    pub fn nodes_for_object(&self, object: u64) -> Vec<&NodeId> {
        self.replicas
            .iter()
            .map(|replica| replica.node_for_object(object))
            .collect()
    }

    /// Index of the replica `node` belongs to.
    pub fn replica_index_of(&self, node: &NodeId) -> Option<usize> {
        self.replicas
            .iter()
            .position(|replica| replica.contains_node(node))
    }

    /// The replica held by `local`, if it is part of the set.
    pub fn local_replica(&self, local: &NodeId) -> Option<&Location> {
        self.replica_index_of(local).map(|idx| &self.replicas[idx])
    }

    /// Last object of the sealed file, judged by the local replica's striping
    /// policy (the first replica's when `local` holds none). `None` when the
    /// recorded size is zero.
    pub fn last_object_number(&self, local: &NodeId) -> Option<u64> {
        let replica = self.local_replica(local).unwrap_or(&self.replicas[0]);
        replica
            .striping_policy()
            .last_object_for_size(self.read_only_file_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    fn replica(names: &[&str]) -> Location {
        let policy = StripingPolicy::raid0(1024, names.len() as u32).unwrap();
        Location::new(policy, nodes(names)).unwrap()
    }

    #[test]
    fn test_width_mismatch_rejected() {
        let policy = StripingPolicy::raid0(1024, 3).unwrap();
        let err = Location::new(policy, nodes(&["a", "b"])).unwrap_err();
        assert!(matches!(err, XtfsError::InvalidArgument { .. }));
        assert!(err.to_string().contains("width 3"));
    }

    #[test]
    fn test_node_lookup() {
        let loc = replica(&["a", "b", "c"]);
        assert_eq!(loc.node_for_object(4).as_str(), "b");
        assert_eq!(loc.node_for_offset(2 * 1024 + 5).as_str(), "c");
        assert_eq!(loc.node_for_byte_range(10, 1000).map(|n| n.as_str()), Some("a"));
        assert_eq!(loc.node_for_byte_range(1000, 1100), None);
    }

    #[test]
    fn test_empty_replica_set_rejected() {
        let err = Locations::new(1, vec![], ReplicaUpdatePolicy::ReadOnly, 1).unwrap_err();
        assert!(matches!(err, XtfsError::InvalidArgument { .. }));
    }

    #[test]
    fn test_update_policy_propagated() {
        let locs = Locations::new(
            3,
            vec![replica(&["a"]), replica(&["b"])],
            ReplicaUpdatePolicy::ReadOnly,
            1,
        )
        .unwrap();
        for r in locs.replicas() {
            assert_eq!(r.replica_update_policy(), Some(ReplicaUpdatePolicy::ReadOnly));
        }
        assert_eq!(locs.sync_level(), 1);
    }

    #[test]
    fn test_nodes_for_object_one_per_replica() {
        let locs = Locations::new(
            1,
            vec![replica(&["a", "b"]), replica(&["c", "d"]), replica(&["e"])],
            ReplicaUpdatePolicy::ReadOnly,
            1,
        )
        .unwrap();
        let found: Vec<&str> = locs.nodes_for_object(1).iter().map(|n| n.as_str()).collect();
        assert_eq!(found, vec!["b", "d", "e"]);
        assert_eq!(locs.replica_index_of(&NodeId::from("d")), Some(1));
        assert_eq!(locs.replica_index_of(&NodeId::from("z")), None);
    }

    #[test]
    fn test_last_object_number_from_read_only_size() {
        let locs = Locations::new(
            1,
            vec![replica(&["a", "b"]), replica(&["c"])],
            ReplicaUpdatePolicy::ReadOnly,
            1,
        )
        .unwrap()
        .with_read_only_file_size(10 * 1024 + 1);
        assert_eq!(locs.last_object_number(&NodeId::from("c")), Some(10));
        assert_eq!(locs.last_object_number(&NodeId::from("unknown")), Some(10));

        let empty = locs.clone().with_read_only_file_size(0);
        assert_eq!(empty.last_object_number(&NodeId::from("a")), None);
    }

    #[test]
    fn test_version_ordering() {
        let old = Locations::new(1, vec![replica(&["a"])], ReplicaUpdatePolicy::ReadOnly, 1).unwrap();
        let new = Locations::new(2, vec![replica(&["a"])], ReplicaUpdatePolicy::ReadOnly, 1).unwrap();
        assert!(new.is_newer_than(&old));
        assert!(!old.is_newer_than(&new));
    }
}

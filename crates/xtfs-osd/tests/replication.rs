//! End-to-end tests of the replication stage against an in-memory cluster.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;
use xtfs_common::{
    Capability, CowPolicy, FileId, Location, Locations, NodeId, ReplicaFlags, ReplicaUpdatePolicy,
    ServiceAvailability, StripingPolicy, TransferStrategyKind,
};
use xtfs_osd::{
    FetchRequest, FetchedObject, LocalObjectStore, ObjectStatus, OsdReplicationConfig,
    RemoteObjectReader, ReplicationError, ReplicationHandle, ReplicationResult, ReplicationStage,
    Waiter,
};

const STRIPE: u64 = 64 * 1024;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Valid,
    Corrupt,
    Unreachable,
    NotFound,
}

/// Remote OSDs keyed by node id. Unknown nodes are unreachable.
struct Cluster {
    behaviours: Mutex<HashMap<NodeId, Behaviour>>,
    gated: AtomicBool,
    gate: Semaphore,
    calls: Mutex<Vec<(NodeId, u64)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Cluster {
    fn new(nodes: &[(&str, Behaviour)]) -> Arc<Self> {
        Arc::new(Self {
            behaviours: Mutex::new(
                nodes
                    .iter()
                    .map(|(node, behaviour)| (NodeId::from(*node), *behaviour))
                    .collect(),
            ),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    /// Hold every read until [`Cluster::open`] is called.
    fn close(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    fn open(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }

    fn calls(&self) -> Vec<(NodeId, u64)> {
        self.calls.lock().unwrap().clone()
    }

    fn payload(file_id: &FileId, object_no: u64, node: &NodeId) -> Bytes {
        Bytes::from(format!("{}/{}@{}", file_id, object_no, node))
    }
}

#[async_trait]
impl RemoteObjectReader for Cluster {
    async fn read_object(
        &self,
        node: &NodeId,
        file_id: &FileId,
        _capability: &Capability,
        _locations: &Locations,
        object_no: u64,
        _request_object_list: bool,
    ) -> ReplicationResult<FetchedObject> {
        self.calls.lock().unwrap().push((node.clone(), object_no));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if self.gated.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await;
            drop(permit);
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }

        let behaviour = self
            .behaviours
            .lock()
            .unwrap()
            .get(node)
            .copied()
            .unwrap_or(Behaviour::Unreachable);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match behaviour {
            Behaviour::Valid => Ok(FetchedObject::valid(Self::payload(file_id, object_no, node))),
            Behaviour::Corrupt => Ok(FetchedObject::corrupt(Bytes::from_static(b"bit rot"))),
            Behaviour::Unreachable => Err(ReplicationError::NodeUnreachable { node: node.clone() }),
            Behaviour::NotFound => Err(ReplicationError::ObjectNotFound {
                node: node.clone(),
                file_id: file_id.clone(),
                object_no,
            }),
        }
    }
}

#[derive(Default)]
struct RecordingStore {
    writes: Mutex<Vec<(FileId, u64, Bytes, CowPolicy)>>,
}

impl RecordingStore {
    fn objects(&self, file_id: &FileId) -> HashSet<u64> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, ..)| f == file_id)
            .map(|(_, o, ..)| *o)
            .collect()
    }

    fn len(&self) -> usize {
        self.writes.lock().unwrap().len()
    }
}

impl LocalObjectStore for RecordingStore {
    fn write_object(
        &self,
        file_id: &FileId,
        object_no: u64,
        data: Bytes,
        _locations: &Locations,
        cow_policy: CowPolicy,
    ) {
        self.writes
            .lock()
            .unwrap()
            .push((file_id.clone(), object_no, data, cow_policy));
    }
}

struct Osd {
    handle: ReplicationHandle,
    cluster: Arc<Cluster>,
    store: Arc<RecordingStore>,
    availability: Arc<ServiceAvailability>,
}

fn osd_config(strategy: TransferStrategyKind, max_in_progress: usize) -> OsdReplicationConfig {
    let mut config = OsdReplicationConfig::default();
    config.dissemination.local_node = NodeId::from("local");
    config.dissemination.default_strategy = strategy;
    config.dissemination.max_objects_in_progress_per_file = max_in_progress;
    config.dissemination.rng_seed = Some(42);
    config
}

fn start_osd(cluster: Arc<Cluster>, strategy: TransferStrategyKind, max_in_progress: usize) -> Osd {
    start_osd_with(cluster, osd_config(strategy, max_in_progress))
}

fn start_osd_with(cluster: Arc<Cluster>, config: OsdReplicationConfig) -> Osd {
    init_tracing();
    let availability = Arc::new(ServiceAvailability::new(config.availability.clone()));
    let store = Arc::new(RecordingStore::default());
    let handle = ReplicationStage::start(
        config.dissemination,
        availability.clone(),
        cluster.clone(),
        store.clone(),
    );
    Osd {
        handle,
        cluster,
        store,
        availability,
    }
}

/// Single-node replicas: the local one, then one per remote.
fn topology(version: u64, objects: u64, local: ReplicaFlags, remotes: &[&str]) -> Arc<Locations> {
    let policy = StripingPolicy::raid0(STRIPE, 1).unwrap();
    let mut replicas = vec![Location::new(policy, vec![NodeId::from("local")])
        .unwrap()
        .with_flags(local)];
    replicas.extend(
        remotes
            .iter()
            .map(|node| Location::new(policy, vec![NodeId::from(*node)]).unwrap()),
    );
    Arc::new(
        Locations::new(version, replicas, ReplicaUpdatePolicy::ReadOnly, 1)
            .unwrap()
            .with_read_only_file_size(objects * STRIPE),
    )
}

fn fetch(file: &str, object_no: u64, locations: &Arc<Locations>) -> FetchRequest {
    FetchRequest {
        file_id: FileId::from(file),
        object_no,
        locations: locations.clone(),
        capability: Capability::new(Bytes::from_static(b"signed-capability")),
        cow_policy: CowPolicy::CowOnce,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !done() {
            tokio::task::yield_now().await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_fetches_share_one_read() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Valid), ("b", Behaviour::Valid)]);
    cluster.close();
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);
    let locations = topology(1, 16, ReplicaFlags::default(), &["a", "b"]);

    let mut receivers = Vec::new();
    for _ in 0..4 {
        let (waiter, rx) = Waiter::channel();
        osd.handle.submit(fetch("F", 7, &locations), waiter).await?;
        receivers.push(rx);
    }
    wait_for(|| osd.cluster.calls().len() == 1).await?;
    osd.cluster.open();

    let mut results = Vec::new();
    for rx in receivers {
        results.push(rx.await?);
    }
    assert_eq!(osd.cluster.calls().len(), 1);
    assert!(matches!(results[0], Ok(ObjectStatus::Exists(_))));
    assert!(results.iter().all(|r| *r == results[0]));
    assert_eq!(osd.store.len(), 1);
    Ok(())
}

#[tokio::test]
async fn corrupt_replica_is_skipped() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Corrupt), ("b", Behaviour::Valid)]);
    let osd = start_osd(cluster, TransferStrategyKind::Simple, 5);
    let locations = topology(1, 16, ReplicaFlags::default(), &["a", "b"]);

    let status = osd.handle.fetch_object(fetch("F", 5, &locations)).await?;
    let expected = Cluster::payload(&FileId::from("F"), 5, &NodeId::from("b"));
    assert_eq!(status, ObjectStatus::Exists(expected.clone()));
    assert_eq!(
        osd.cluster.calls(),
        vec![(NodeId::from("a"), 5), (NodeId::from("b"), 5)]
    );

    let writes = osd.store.writes.lock().unwrap().clone();
    assert_eq!(
        writes,
        vec![(FileId::from("F"), 5, expected, CowPolicy::CowOnce)]
    );
    assert_eq!(osd.handle.stats().checksum_mismatches, 1);
    Ok(())
}

#[tokio::test]
async fn object_past_end_of_file_is_padding() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::NotFound), ("b", Behaviour::NotFound)]);
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);
    // 11 objects: the last one is object 10
    let locations = topology(1, 11, ReplicaFlags::default(), &["a", "b"]);

    let status = osd.handle.fetch_object(fetch("F", 20, &locations)).await?;
    assert_eq!(status, ObjectStatus::PaddingObject);
    assert_eq!(osd.store.len(), 0);
    assert_eq!(osd.handle.stats().holes, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_object_fails_then_starts_fresh() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::NotFound), ("b", Behaviour::NotFound)]);
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);
    let locations = topology(1, 16, ReplicaFlags::default(), &["a", "b"]);

    let err = osd
        .handle
        .fetch_object(fetch("F", 3, &locations))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ReplicationError::NoReplicaAvailable {
            file_id: FileId::from("F"),
            object_no: 3
        }
    );
    let asked: HashSet<NodeId> = osd.cluster.calls().into_iter().map(|(n, _)| n).collect();
    assert_eq!(asked.len(), 2);

    // a replica recovers; the next request is not poisoned by the failure
    osd.cluster
        .behaviours
        .lock()
        .unwrap()
        .insert(NodeId::from("b"), Behaviour::Valid);
    let status = osd.handle.fetch_object(fetch("F", 3, &locations)).await?;
    assert!(matches!(status, ObjectStatus::Exists(_)));
    assert_eq!(osd.handle.stats().failures, 1);
    Ok(())
}

#[tokio::test]
async fn unreachable_replicas_are_backed_off() -> Result<()> {
    let cluster = Cluster::new(&[("b", Behaviour::Valid)]);
    let osd = start_osd(cluster, TransferStrategyKind::Simple, 5);
    let locations = topology(1, 16, ReplicaFlags::default(), &["a", "b"]);

    osd.handle.fetch_object(fetch("F", 0, &locations)).await?;
    assert!(!osd.availability.is_available(&NodeId::from("a")));
    assert!(osd.availability.is_available(&NodeId::from("b")));

    osd.handle.fetch_object(fetch("G", 0, &locations)).await?;
    let asked: Vec<String> = osd
        .cluster
        .calls()
        .into_iter()
        .map(|(node, _)| node.to_string())
        .collect();
    assert_eq!(asked, ["a", "b", "b"]);
    Ok(())
}

#[tokio::test]
async fn backed_off_node_is_never_asked() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Valid), ("b", Behaviour::Valid)]);
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);
    osd.availability.mark_unavailable(&NodeId::from("a"));
    let locations = topology(1, 16, ReplicaFlags::default(), &["a", "b"]);

    for object_no in 0..8 {
        osd.handle.fetch_object(fetch("F", object_no, &locations)).await?;
    }
    assert!(osd
        .cluster
        .calls()
        .iter()
        .all(|(node, _)| node.as_str() == "b"));
    Ok(())
}

#[tokio::test]
async fn cancelled_file_is_not_written_back() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Valid)]);
    cluster.close();
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);
    let locations = topology(1, 16, ReplicaFlags::default(), &["a"]);

    let (waiter, rx) = Waiter::channel();
    osd.handle.submit(fetch("F", 2, &locations), waiter).await?;
    wait_for(|| osd.cluster.calls().len() == 1).await?;
    osd.handle.cancel_file(FileId::from("F")).await?;
    osd.cluster.open();

    assert!(matches!(rx.await?, Ok(ObjectStatus::Exists(_))));
    wait_for(|| osd.handle.stats().files_in_progress == 0).await?;
    assert_eq!(osd.store.len(), 0);
    Ok(())
}

#[tokio::test]
async fn full_replica_is_filled_in_background() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Valid), ("b", Behaviour::Valid)]);
    let osd = start_osd(cluster, TransferStrategyKind::Random, 3);
    let flags = ReplicaFlags {
        full_replica: true,
        ..ReplicaFlags::default()
    };
    let locations = topology(1, 12, flags, &["a", "b"]);
    let file = FileId::from("F");

    let status = osd.handle.fetch_object(fetch("F", 9, &locations)).await?;
    assert!(matches!(status, ObjectStatus::Exists(_)));

    wait_for(|| osd.store.objects(&file).len() == 12).await?;
    wait_for(|| osd.handle.stats().files_in_progress == 0).await?;
    assert_eq!(osd.store.objects(&file), (0..12).collect());
    assert_eq!(osd.cluster.calls().len(), 12);
    assert!(osd.cluster.max_in_flight.load(Ordering::SeqCst) <= 3);
    Ok(())
}

#[tokio::test]
async fn full_replicas_share_the_overall_read_budget() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Valid), ("b", Behaviour::Valid)]);
    cluster.close();
    let mut config = osd_config(TransferStrategyKind::Simple, 3);
    config.dissemination.max_objects_in_progress_overall = 4;
    let osd = start_osd_with(cluster, config);
    let flags = ReplicaFlags {
        full_replica: true,
        ..ReplicaFlags::default()
    };
    let locations = topology(1, 8, flags, &["a", "b"]);

    let (first, first_rx) = Waiter::channel();
    osd.handle.submit(fetch("F", 0, &locations), first).await?;
    let (second, second_rx) = Waiter::channel();
    osd.handle.submit(fetch("G", 0, &locations), second).await?;
    wait_for(|| osd.cluster.calls().len() == 4).await?;
    osd.cluster.open();

    assert!(matches!(first_rx.await?, Ok(ObjectStatus::Exists(_))));
    assert!(matches!(second_rx.await?, Ok(ObjectStatus::Exists(_))));
    wait_for(|| osd.handle.stats().files_in_progress == 0).await?;
    assert_eq!(osd.store.objects(&FileId::from("F")), (0..8).collect());
    assert_eq!(osd.store.objects(&FileId::from("G")), (0..8).collect());
    assert!(osd.cluster.max_in_flight.load(Ordering::SeqCst) <= 4);
    Ok(())
}

#[tokio::test]
async fn stale_locations_are_rejected() -> Result<()> {
    let cluster = Cluster::new(&[("a", Behaviour::Valid)]);
    cluster.close();
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);
    let current = topology(4, 16, ReplicaFlags::default(), &["a"]);
    let stale = topology(3, 16, ReplicaFlags::default(), &["a"]);

    let (waiter, pending) = Waiter::channel();
    osd.handle.submit(fetch("F", 0, &current), waiter).await?;
    let err = osd
        .handle
        .fetch_object(fetch("F", 1, &stale))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ReplicationError::StaleLocations {
            file_id: FileId::from("F"),
            requested: 3,
            current: 4
        }
    );

    osd.cluster.open();
    assert!(pending.await?.is_ok());
    Ok(())
}

#[tokio::test]
async fn striped_replicas_route_objects_to_their_column() -> Result<()> {
    let cluster = Cluster::new(&[
        ("a0", Behaviour::Valid),
        ("a1", Behaviour::Valid),
        ("b0", Behaviour::Valid),
        ("b1", Behaviour::Valid),
    ]);
    let osd = start_osd(cluster, TransferStrategyKind::Random, 5);

    let policy = StripingPolicy::raid0(STRIPE, 2)?;
    let replica = |a: &str, b: &str| Location::new(policy, vec![NodeId::from(a), NodeId::from(b)]);
    let locations = Arc::new(
        Locations::new(
            1,
            vec![
                replica("local", "local-1")?,
                replica("a0", "a1")?.with_flags(ReplicaFlags::complete()),
                replica("b0", "b1")?,
            ],
            ReplicaUpdatePolicy::ReadOnly,
            1,
        )?
        .with_read_only_file_size(16 * STRIPE),
    );

    for object_no in 0..6 {
        osd.handle.fetch_object(fetch("F", object_no, &locations)).await?;
    }
    for (node, object_no) in osd.cluster.calls() {
        let column = if object_no % 2 == 0 { '0' } else { '1' };
        assert!(node.as_str().ends_with(column), "{} served {}", node, object_no);
    }
    Ok(())
}

#[tokio::test]
async fn config_from_json_drives_the_stage() -> Result<()> {
    init_tracing();
    let config = OsdReplicationConfig::from_json_str(
        r#"{
            "dissemination": { "local_node": "local", "default_strategy": "simple", "rng_seed": 7 },
            "availability": { "initial_timeout_ms": 1000 }
        }"#,
    )?;
    let cluster = Cluster::new(&[("a", Behaviour::Valid)]);
    let store = Arc::new(RecordingStore::default());
    let availability = Arc::new(ServiceAvailability::new(config.availability.clone()));
    let handle = ReplicationStage::start(config.dissemination, availability, cluster, store.clone());

    let locations = topology(1, 4, ReplicaFlags::default(), &["a"]);
    handle.fetch_object(fetch("F", 1, &locations)).await?;
    assert_eq!(store.len(), 1);

    handle.shutdown().await?;
    wait_for(|| !handle.is_running()).await?;
    Ok(())
}

//! Object dissemination: single-flight fetching of objects from other replicas.
//!
//! [`ObjectDissemination`] owns the bookkeeping of every file this OSD is
//! currently filling. For each file it keeps a [`TransferStrategy`] and the set
//! of objects in flight, each with the callers waiting for it. Concurrent
//! requests for the same object share one remote read.
//!
//! The type has no locks. It is meant to be owned by one task (see
//! [`crate::stage`]); remote reads run on spawned tasks and report back as
//! [`ReadCompletion`] messages that the owner feeds to
//! [`ObjectDissemination::handle_completion`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use xtfs_common::{Capability, CowPolicy, FileId, Locations, NodeId, ServiceAvailability};

use crate::config::DisseminationConfig;
use crate::error::{ReplicationError, ReplicationResult};
use crate::object_io::{FetchedObject, LocalObjectStore, RemoteObjectReader};
use crate::strategy::{NextRequest, TransferStrategy};

/// A request for one object of a file.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// File the object belongs to.
    pub file_id: FileId,
    /// Object number.
    pub object_no: u64,
    /// Replica set the caller knows about.
    pub locations: Arc<Locations>,
    /// Authorization forwarded to remote reads.
    pub capability: Capability,
    /// Copy-on-write policy for the local write-back.
    pub cow_policy: CowPolicy,
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStatus {
    /// The object exists; its data.
    Exists(Bytes),
    /// The object lies in a sparse region of the file and reads as zeros.
    PaddingObject,
}

/// Result delivered to every waiter of an object.
pub type FetchResult = Result<ObjectStatus, ReplicationError>;

/// Receiving end of a [`Waiter`].
pub type WaiterReceiver = oneshot::Receiver<FetchResult>;

/// A caller waiting for an object. Completed exactly once.
#[derive(Debug)]
pub struct Waiter(oneshot::Sender<FetchResult>);

impl Waiter {
    /// Wrap an existing oneshot sender.
    pub fn new(tx: oneshot::Sender<FetchResult>) -> Self {
        Self(tx)
    }

    /// A waiter plus the receiver its result arrives on.
    pub fn channel() -> (Self, WaiterReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub(crate) fn complete(self, result: FetchResult) {
        if self.0.send(result).is_err() {
            debug!("waiter went away before the object was resolved");
        }
    }
}

/// Result of a remote read, sent back to the task owning the dissemination.
#[derive(Debug)]
pub struct ReadCompletion {
    /// File the object belongs to.
    pub file_id: FileId,
    /// Object number.
    pub object_no: u64,
    /// Node the object was read from.
    pub node: NodeId,
    /// What the node returned.
    pub result: ReplicationResult<FetchedObject>,
}

/// Counters of the dissemination since it was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisseminationStats {
    /// Objects fetched with a valid checksum.
    pub objects_fetched: u64,
    /// Payload bytes of those objects.
    pub bytes_fetched: u64,
    /// Objects resolved as padding.
    pub holes: u64,
    /// Objects no replica could supply.
    pub failures: u64,
    /// Reads reissued after a failed or corrupt read.
    pub retries: u64,
    /// Reads that returned data with a bad checksum.
    pub checksum_mismatches: u64,
    /// Files currently tracked.
    pub files_in_progress: usize,
}

#[derive(Debug, Default)]
struct ObjectState {
    waiters: Vec<Waiter>,
    last_node_tried: Option<NodeId>,
}

#[derive(Debug)]
struct FileInfo {
    strategy: TransferStrategy,
    last_object: Option<u64>,
    capability: Capability,
    cow_policy: CowPolicy,
    objects_in_progress: HashMap<u64, ObjectState>,
    full_replica: bool,
    cancelled: bool,
}

impl FileInfo {
    fn new(config: &DisseminationConfig, request: FetchRequest, seed: Option<u64>) -> Self {
        let FetchRequest {
            file_id,
            locations,
            capability,
            cow_policy,
            ..
        } = request;
        let local = locations.local_replica(&config.local_node);
        let flags = local.map(|replica| replica.flags()).unwrap_or_default();
        // a full replica only fills the stripe column this node stores
        let column = local.and_then(|replica| {
            let column = replica
                .nodes()
                .iter()
                .position(|node| *node == config.local_node)?;
            Some((*replica.striping_policy(), column))
        });
        let kind = flags.strategy.unwrap_or(config.default_strategy);
        let last_object = locations.last_object_number(&config.local_node);
        let mut strategy =
            TransferStrategy::new(kind, file_id, config.local_node.clone(), locations, seed);
        if flags.full_replica {
            if let (Some((policy, column)), Some(last)) = (column, last_object) {
                for object in policy.objects_of_node(column, 0, last) {
                    strategy.add_required(object);
                }
            }
        }
        Self {
            strategy,
            last_object,
            capability,
            cow_policy,
            objects_in_progress: HashMap::new(),
            full_replica: flags.full_replica,
            cancelled: false,
        }
    }

    /// Objects past the last written one are sparse.
    fn is_hole(&self, object_no: u64) -> bool {
        self.last_object.map_or(true, |last| object_no > last)
    }
}

/// Coordinates object fetches for every file this OSD is filling.
pub struct ObjectDissemination {
    config: DisseminationConfig,
    availability: Arc<ServiceAvailability>,
    reader: Arc<dyn RemoteObjectReader>,
    store: Arc<dyn LocalObjectStore>,
    completions: mpsc::UnboundedSender<ReadCompletion>,
    files: HashMap<FileId, FileInfo>,
    files_started: u64,
    stats: DisseminationStats,
}

impl ObjectDissemination {
    /// Create a dissemination. Remote read results are sent to `completions`.
    pub fn new(
        config: DisseminationConfig,
        availability: Arc<ServiceAvailability>,
        reader: Arc<dyn RemoteObjectReader>,
        store: Arc<dyn LocalObjectStore>,
        completions: mpsc::UnboundedSender<ReadCompletion>,
    ) -> Self {
        Self {
            config,
            availability,
            reader,
            store,
            completions,
            files: HashMap::new(),
            files_started: 0,
            stats: DisseminationStats::default(),
        }
    }

    /// Fetch an object on behalf of `waiter`.
    ///
    /// Joins an outstanding read of the same object if there is one.
    /// Requests carrying an older replica set than the file's current one
    /// fail with [`ReplicationError::StaleLocations`].
    pub fn fetch_object(&mut self, request: FetchRequest, waiter: Waiter) {
        let file_id = request.file_id.clone();
        let object_no = request.object_no;
        let seed = self
            .config
            .rng_seed
            .map(|seed| seed.wrapping_add(self.files_started));

        let file = match self.files.entry(file_id.clone()) {
            Entry::Occupied(entry) => {
                let file = entry.into_mut();
                let current = file.strategy.locations().version();
                if request.locations.version() < current {
                    debug!(
                        file_id = %file_id,
                        requested = request.locations.version(),
                        current,
                        "rejecting request with stale locations"
                    );
                    waiter.complete(Err(ReplicationError::StaleLocations {
                        file_id,
                        requested: request.locations.version(),
                        current,
                    }));
                    return;
                }
                file.capability = request.capability;
                file.cow_policy = request.cow_policy;
                if request.locations.is_newer_than(file.strategy.locations()) {
                    file.last_object = request
                        .locations
                        .last_object_number(&self.config.local_node);
                    file.strategy.update_locations(request.locations);
                }
                file
            }
            Entry::Vacant(entry) => {
                self.files_started += 1;
                let file = FileInfo::new(&self.config, request, seed);
                info!(
                    file_id = %file_id,
                    strategy = ?file.strategy.kind(),
                    last_object = ?file.last_object,
                    full_replica = file.full_replica,
                    "started replicating file"
                );
                entry.insert(file)
            }
        };

        let state = file.objects_in_progress.entry(object_no).or_default();
        let in_flight = state.last_node_tried.is_some();
        state.waiters.push(waiter);
        if in_flight {
            debug!(
                file_id = %file_id,
                object_no,
                waiters = state.waiters.len(),
                "joined outstanding fetch"
            );
            return;
        }

        file.strategy.add_preferred(object_no);
        self.prepare_request(&file_id, object_no);
        self.advance(&file_id);
    }

    /// Issue a read of `object_no` against the next usable candidate node.
    ///
    /// Backed-off nodes are dropped from the candidates. When no candidate
    /// is left the object is resolved: as padding if it is a hole, otherwise
    /// with [`ReplicationError::NoReplicaAvailable`].
    pub fn prepare_request(&mut self, file_id: &FileId, object_no: u64) {
        let Some(file) = self.files.get_mut(file_id) else {
            return;
        };
        if !file.objects_in_progress.contains_key(&object_no) {
            return;
        }

        let next = loop {
            match file.strategy.select_next_node(object_no) {
                Some(next) if !self.availability.is_available(&next.node) => {
                    debug!(file_id = %file_id, object_no, node = %next.node, "skipping backed-off OSD");
                    file.strategy.remove_node_for_object(object_no, &next.node);
                }
                other => break other,
            }
        };

        let hole = file.is_hole(object_no);
        match next {
            Some(next) => self.dispatch(file_id, next),
            None if hole => {
                debug!(file_id = %file_id, object_no, "no replica has the object, treating it as a hole");
                self.resolve_hole(file_id, object_no);
            }
            None => {
                warn!(file_id = %file_id, object_no, "no replica could supply object");
                self.stats.failures += 1;
                let err = ReplicationError::NoReplicaAvailable {
                    file_id: file_id.clone(),
                    object_no,
                };
                self.resolve(file_id, object_no, Err(err));
            }
        }
    }

    /// Process the result of a remote read.
    ///
    /// Completions for files or objects that are no longer tracked, or that
    /// do not come from the node last tried, are ignored.
    pub fn handle_completion(&mut self, completion: ReadCompletion) {
        let ReadCompletion {
            file_id,
            object_no,
            node,
            result,
        } = completion;
        let Some(file) = self.files.get_mut(&file_id) else {
            debug!(file_id = %file_id, object_no, "completion for untracked file ignored");
            return;
        };
        let expected = file
            .objects_in_progress
            .get(&object_no)
            .and_then(|state| state.last_node_tried.as_ref());
        if expected != Some(&node) {
            debug!(file_id = %file_id, object_no, node = %node, "unexpected completion ignored");
            return;
        }

        match result {
            Ok(fetched) => {
                if let Some(objects) = fetched.object_list {
                    file.strategy.set_object_list(&node, objects);
                }
                self.on_object_fetched(&file_id, object_no, fetched.data, fetched.checksum_valid);
            }
            Err(err) => {
                if err.is_node_failure() {
                    self.availability.mark_unavailable(&node);
                }
                warn!(file_id = %file_id, object_no, node = %node, error = %err, "object read failed");
                self.on_object_not_fetched(&file_id, object_no);
            }
        }
    }

    /// An object arrived from the node last tried.
    ///
    /// Valid data resolves every waiter and is written back unless the file
    /// was cancelled. Corrupt data drops that node and retries.
    pub fn on_object_fetched(
        &mut self,
        file_id: &FileId,
        object_no: u64,
        data: Bytes,
        checksum_valid: bool,
    ) {
        let Some(file) = self.files.get_mut(file_id) else {
            return;
        };
        let Some(state) = file.objects_in_progress.get(&object_no) else {
            return;
        };

        if !checksum_valid {
            self.stats.checksum_mismatches += 1;
            self.stats.retries += 1;
            if let Some(node) = state.last_node_tried.clone() {
                warn!(file_id = %file_id, object_no, node = %node, "checksum mismatch, trying another replica");
                file.strategy.remove_node_for_object(object_no, &node);
            }
            file.strategy.add_preferred(object_no);
            self.prepare_request(file_id, object_no);
            self.advance(file_id);
            return;
        }

        self.stats.objects_fetched += 1;
        self.stats.bytes_fetched += data.len() as u64;
        if file.cancelled {
            debug!(file_id = %file_id, object_no, "file cancelled, skipping write-back");
        } else {
            self.store.write_object(
                file_id,
                object_no,
                data.clone(),
                file.strategy.locations(),
                file.cow_policy,
            );
        }
        debug!(file_id = %file_id, object_no, bytes = data.len(), "object fetched");
        self.resolve(file_id, object_no, Ok(ObjectStatus::Exists(data)));
        self.advance(file_id);
    }

    /// The read from the node last tried failed.
    ///
    /// Holes resolve as padding right away; anything else is retried on the
    /// next candidate.
    pub fn on_object_not_fetched(&mut self, file_id: &FileId, object_no: u64) {
        let Some(file) = self.files.get_mut(file_id) else {
            return;
        };
        let Some(state) = file.objects_in_progress.get(&object_no) else {
            return;
        };

        if file.is_hole(object_no) {
            debug!(file_id = %file_id, object_no, last_object = ?file.last_object, "object is a hole");
            self.resolve_hole(file_id, object_no);
        } else {
            self.stats.retries += 1;
            if let Some(node) = state.last_node_tried.clone() {
                file.strategy.remove_node_for_object(object_no, &node);
            }
            file.strategy.add_preferred(object_no);
            self.prepare_request(file_id, object_no);
        }
        self.advance(file_id);
    }

    /// Stop replicating a file.
    ///
    /// A file with nothing in flight is dropped right away. Otherwise reads
    /// already issued still resolve their waiters, but their data is not
    /// written back and no background fetch is started.
    pub fn cancel_file(&mut self, file_id: &FileId) {
        let Some(file) = self.files.get_mut(file_id) else {
            debug!(file_id = %file_id, "cancel for untracked file ignored");
            return;
        };
        if file.objects_in_progress.is_empty() {
            self.files.remove(file_id);
            info!(file_id = %file_id, "file replication cancelled");
        } else {
            file.cancelled = true;
            info!(
                file_id = %file_id,
                in_flight = file.objects_in_progress.len(),
                "file replication cancelled, waiting for reads in flight"
            );
        }
    }

    /// Fail every pending waiter with [`ReplicationError::Shutdown`] and drop
    /// all bookkeeping.
    pub fn shutdown(&mut self) {
        let mut failed = 0usize;
        for (_, file) in self.files.drain() {
            for (_, state) in file.objects_in_progress {
                for waiter in state.waiters {
                    waiter.complete(Err(ReplicationError::Shutdown));
                    failed += 1;
                }
            }
        }
        info!(failed_waiters = failed, "object dissemination shut down");
    }

    /// Current counters.
    pub fn stats(&self) -> DisseminationStats {
        DisseminationStats {
            files_in_progress: self.files.len(),
            ..self.stats.clone()
        }
    }

    /// Whether `file_id` is being replicated.
    pub fn is_tracking(&self, file_id: &FileId) -> bool {
        self.files.contains_key(file_id)
    }

    /// Number of objects of `file_id` in flight.
    pub fn objects_in_progress(&self, file_id: &FileId) -> usize {
        self.files
            .get(file_id)
            .map_or(0, |file| file.objects_in_progress.len())
    }

    fn dispatch(&mut self, file_id: &FileId, next: NextRequest) {
        let Some(file) = self.files.get_mut(file_id) else {
            return;
        };
        let Some(state) = file.objects_in_progress.get_mut(&next.object_no) else {
            return;
        };
        state.last_node_tried = Some(next.node.clone());
        debug!(
            file_id = %file_id,
            object_no = next.object_no,
            node = %next.node,
            request_object_list = next.request_object_list,
            "reading object from replica"
        );

        let reader = Arc::clone(&self.reader);
        let completions = self.completions.clone();
        let capability = file.capability.clone();
        let locations = Arc::clone(file.strategy.locations());
        let file_id = file_id.clone();
        tokio::spawn(async move {
            let result = reader
                .read_object(
                    &next.node,
                    &file_id,
                    &capability,
                    &locations,
                    next.object_no,
                    next.request_object_list,
                )
                .await;
            let completion = ReadCompletion {
                file_id,
                object_no: next.object_no,
                node: next.node,
                result,
            };
            if completions.send(completion).is_err() {
                debug!("dissemination gone, dropping read completion");
            }
        });
    }

    fn resolve(&mut self, file_id: &FileId, object_no: u64, result: FetchResult) {
        let Some(file) = self.files.get_mut(file_id) else {
            return;
        };
        file.strategy.remove_required(object_no);
        if let Some(state) = file.objects_in_progress.remove(&object_no) {
            for waiter in state.waiters {
                waiter.complete(result.clone());
            }
        }
    }

    /// Resolve a sparse object as padding and mark it in the local store.
    fn resolve_hole(&mut self, file_id: &FileId, object_no: u64) {
        let Some(file) = self.files.get(file_id) else {
            return;
        };
        self.stats.holes += 1;
        if !file.cancelled {
            self.store
                .insert_padding_object(file_id, object_no, file.strategy.locations());
        }
        self.resolve(file_id, object_no, Ok(ObjectStatus::PaddingObject));
    }

    /// Start background fetches, then drop the file if nothing is left.
    fn advance(&mut self, file_id: &FileId) {
        self.fill_background(file_id);
        let idle = self
            .files
            .get(file_id)
            .is_some_and(|file| file.objects_in_progress.is_empty());
        if idle {
            self.files.remove(file_id);
            info!(file_id = %file_id, "finished replicating file");
        }
    }

    fn fill_background(&mut self, file_id: &FileId) {
        let overall = self.config.max_objects_in_progress_overall;
        // the overall budget is shared evenly by the files being tracked
        let limit = (overall / self.files.len().max(1))
            .clamp(1, self.config.max_objects_in_progress_per_file.max(1));
        loop {
            let in_flight: usize = self
                .files
                .values()
                .map(|file| file.objects_in_progress.len())
                .sum();
            let Some(file) = self.files.get_mut(file_id) else {
                return;
            };
            let busy = file.objects_in_progress.len();
            // a file with nothing in flight may always start one read
            if !file.full_replica
                || file.cancelled
                || busy >= limit
                || (busy > 0 && in_flight >= overall)
            {
                return;
            }
            let Some(next) = file.strategy.select_next() else {
                return;
            };
            if file.objects_in_progress.contains_key(&next.object_no) {
                continue;
            }
            file.objects_in_progress
                .insert(next.object_no, ObjectState::default());
            debug!(file_id = %file_id, object_no = next.object_no, "background fetch");
            if self.availability.is_available(&next.node) {
                self.dispatch(file_id, next);
            } else {
                file.strategy.remove_node_for_object(next.object_no, &next.node);
                self.prepare_request(file_id, next.object_no);
            }
        }
    }
}

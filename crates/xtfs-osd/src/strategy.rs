//! Transfer strategies: which object to fetch next and from which replica.
//!
//! A [`TransferStrategy`] is created per file being replicated. It keeps two
//! object queues:
//!
//! - `required`: every object that still has to be fetched,
//! - `preferred`: objects somebody is waiting for; always a subset of `required`.
//!
//! For each tracked object it caches the list of candidate nodes (one per
//! remote replica, complete replicas first, the local replica excluded). The
//! list is computed once when the object is added. Nodes removed after a
//! failed attempt stay removed until the object is dropped, also across
//! replica set updates.
//!
//! Two variants exist:
//!
//! - **Random**: objects and nodes are picked uniformly at random.
//! - **Simple**: objects are taken in insertion order, nodes round-robin
//!   with one cursor per file.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use xtfs_common::{FileId, Locations, NodeId, TransferStrategyKind};

/// The next fetch a strategy wants issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextRequest {
    /// Node to read from.
    pub node: NodeId,
    /// Object to read.
    pub object_no: u64,
    /// Ask the node for the list of objects it stores.
    pub request_object_list: bool,
}

/// Insertion-ordered set of object numbers.
///
/// Removal is lazy: `order` may hold stale entries, an entry is live only
/// while its sequence number matches the one in `members`.
#[derive(Debug, Default)]
struct ObjectQueue {
    order: VecDeque<(u64, u64)>,
    members: HashMap<u64, u64>,
    next_seq: u64,
}

impl ObjectQueue {
    fn insert(&mut self, object: u64) -> bool {
        if self.members.contains_key(&object) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(object, seq);
        self.order.push_back((object, seq));
        true
    }

    fn remove(&mut self, object: u64) -> bool {
        let removed = self.members.remove(&object).is_some();
        if self.members.is_empty() {
            self.order.clear();
        }
        removed
    }

    fn contains(&self, object: u64) -> bool {
        self.members.contains_key(&object)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn is_live(&self, object: u64, seq: u64) -> bool {
        self.members.get(&object) == Some(&seq)
    }

    fn pop_front(&mut self) -> Option<u64> {
        while let Some((object, seq)) = self.order.pop_front() {
            if self.is_live(object, seq) {
                self.members.remove(&object);
                return Some(object);
            }
        }
        None
    }

    fn take_random(&mut self, rng: &mut StdRng) -> Option<u64> {
        while !self.order.is_empty() {
            let idx = rng.gen_range(0..self.order.len());
            let (object, seq) = self.order.swap_remove_back(idx)?;
            if self.is_live(object, seq) {
                self.members.remove(&object);
                return Some(object);
            }
        }
        None
    }
}

#[derive(Debug)]
enum Selector {
    Random { rng: StdRng },
    Simple { cursor: usize },
}

/// Per-file object and replica selection.
#[derive(Debug)]
pub struct TransferStrategy {
    file_id: FileId,
    local_node: NodeId,
    locations: Arc<Locations>,
    required: ObjectQueue,
    preferred: ObjectQueue,
    candidates: HashMap<u64, Vec<NodeId>>,
    failed: HashMap<u64, HashSet<NodeId>>,
    complete_nodes: HashSet<NodeId>,
    object_lists: HashMap<NodeId, HashSet<u64>>,
    selector: Selector,
}

impl TransferStrategy {
    /// Create a strategy for `file_id` as seen from `local_node`.
    ///
    /// `seed` makes the random variant deterministic.
    pub fn new(
        kind: TransferStrategyKind,
        file_id: FileId,
        local_node: NodeId,
        locations: Arc<Locations>,
        seed: Option<u64>,
    ) -> Self {
        let selector = match kind {
            TransferStrategyKind::Random => Selector::Random {
                rng: match seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                },
            },
            TransferStrategyKind::Simple => Selector::Simple { cursor: 0 },
        };
        let complete_nodes = complete_nodes(&locations, &local_node);
        Self {
            file_id,
            local_node,
            locations,
            required: ObjectQueue::default(),
            preferred: ObjectQueue::default(),
            candidates: HashMap::new(),
            failed: HashMap::new(),
            complete_nodes,
            object_lists: HashMap::new(),
            selector,
        }
    }

    /// Variant of this strategy.
    pub fn kind(&self) -> TransferStrategyKind {
        match self.selector {
            Selector::Random { .. } => TransferStrategyKind::Random,
            Selector::Simple { .. } => TransferStrategyKind::Simple,
        }
    }

    /// File this strategy replicates.
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    /// Replica set the candidate lists are derived from.
    pub fn locations(&self) -> &Arc<Locations> {
        &self.locations
    }

    /// Track `object` as required.
    pub fn add_required(&mut self, object: u64) {
        self.required.insert(object);
        self.cache_candidates(object);
    }

    /// Track `object` as preferred (and therefore required).
    pub fn add_preferred(&mut self, object: u64) {
        self.add_required(object);
        self.preferred.insert(object);
    }

    /// Stop tracking `object` and forget its candidate nodes.
    pub fn remove_required(&mut self, object: u64) -> bool {
        self.preferred.remove(object);
        let removed = self.required.remove(object);
        self.candidates.remove(&object);
        self.failed.remove(&object);
        removed
    }

    /// Lower `object` from preferred to merely required.
    pub fn remove_preferred(&mut self, object: u64) -> bool {
        self.preferred.remove(object)
    }

    /// Whether `object` is queued as required.
    pub fn is_required(&self, object: u64) -> bool {
        self.required.contains(object)
    }

    /// Whether `object` is queued as preferred.
    pub fn is_preferred(&self, object: u64) -> bool {
        self.preferred.contains(object)
    }

    /// Number of queued objects.
    pub fn objects_count(&self) -> usize {
        self.required.len()
    }

    /// Whether no object is queued.
    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    /// Remaining candidate nodes of `object`, if it is tracked.
    pub fn candidate_nodes(&self, object: u64) -> Option<&[NodeId]> {
        self.candidates.get(&object).map(Vec::as_slice)
    }

    /// Forget `node` as a source for `object`, e.g. after a failed read.
    pub fn remove_node_for_object(&mut self, object: u64, node: &NodeId) -> bool {
        let Some(nodes) = self.candidates.get_mut(&object) else {
            return false;
        };
        self.failed.entry(object).or_default().insert(node.clone());
        let before = nodes.len();
        nodes.retain(|n| n != node);
        nodes.len() != before
    }

    /// Record which objects `node` stores. Nodes of partial replicas that do
    /// not list an object are skipped for it from now on.
    pub fn set_object_list(&mut self, node: &NodeId, objects: impl IntoIterator<Item = u64>) {
        let objects: HashSet<u64> = objects.into_iter().collect();
        debug!(
            file_id = %self.file_id,
            node = %node,
            objects = objects.len(),
            "object list received"
        );
        self.object_lists.insert(node.clone(), objects);
    }

    /// Switch to a newer replica set and recompute cached candidate lists.
    ///
    /// Nodes already removed for an object are not brought back. Older or
    /// equal versions are ignored.
    pub fn update_locations(&mut self, locations: Arc<Locations>) {
        if !locations.is_newer_than(&self.locations) {
            return;
        }
        debug!(
            file_id = %self.file_id,
            old_version = self.locations.version(),
            new_version = locations.version(),
            "replica set updated"
        );
        self.locations = locations;
        self.complete_nodes = complete_nodes(&self.locations, &self.local_node);
        let objects: Vec<u64> = self.candidates.keys().copied().collect();
        for object in objects {
            let nodes = self.compute_candidates(object);
            self.candidates.insert(object, nodes);
        }
    }

    /// Pick the next object to fetch and a node to fetch it from.
    ///
    /// Preferred objects go first. The picked object leaves both queues but
    /// keeps its candidate list, so retries go through [`Self::select_next_node`].
    /// Objects without any candidate left are dropped.
    pub fn select_next(&mut self) -> Option<NextRequest> {
        loop {
            let object = self.pick_object()?;
            if let Some(next) = self.select_next_node(object) {
                return Some(next);
            }
            debug!(file_id = %self.file_id, object, "no candidate node left, dropping object");
            self.candidates.remove(&object);
            self.failed.remove(&object);
        }
    }

    /// Pick a node to fetch `object` from, `None` once no candidate remains.
    pub fn select_next_node(&mut self, object: u64) -> Option<NextRequest> {
        if !self.candidates.contains_key(&object) {
            let nodes = self.compute_candidates(object);
            self.candidates.insert(object, nodes);
        }

        let object_lists = &self.object_lists;
        let nodes = self.candidates.get_mut(&object)?;
        nodes.retain(|node| {
            object_lists
                .get(node)
                .map_or(true, |objects| objects.contains(&object))
        });
        if nodes.is_empty() {
            return None;
        }

        let idx = match &mut self.selector {
            Selector::Random { rng } => rng.gen_range(0..nodes.len()),
            Selector::Simple { cursor } => {
                let idx = *cursor % nodes.len();
                *cursor = cursor.wrapping_add(1);
                idx
            }
        };
        let node = nodes[idx].clone();
        let request_object_list =
            !self.complete_nodes.contains(&node) && !self.object_lists.contains_key(&node);
        Some(NextRequest {
            node,
            object_no: object,
            request_object_list,
        })
    }

    fn pick_object(&mut self) -> Option<u64> {
        let queue = if self.preferred.is_empty() {
            &mut self.required
        } else {
            &mut self.preferred
        };
        let object = match &mut self.selector {
            Selector::Random { rng } => queue.take_random(rng),
            Selector::Simple { .. } => queue.pop_front(),
        }?;
        self.preferred.remove(object);
        self.required.remove(object);
        Some(object)
    }

    fn cache_candidates(&mut self, object: u64) {
        if !self.candidates.contains_key(&object) {
            let nodes = self.compute_candidates(object);
            self.candidates.insert(object, nodes);
        }
    }

    fn compute_candidates(&self, object: u64) -> Vec<NodeId> {
        let local_replica = self.locations.replica_index_of(&self.local_node);
        let failed = self.failed.get(&object);
        let mut complete = Vec::new();
        let mut partial = Vec::new();
        for (idx, replica) in self.locations.replicas().iter().enumerate() {
            if Some(idx) == local_replica {
                continue;
            }
            let node = replica.node_for_object(object);
            if *node == self.local_node
                || failed.is_some_and(|f| f.contains(node))
                || complete.contains(node)
                || partial.contains(node)
            {
                continue;
            }
            if replica.flags().complete {
                complete.push(node.clone());
            } else {
                partial.push(node.clone());
            }
        }
        complete.extend(partial);
        complete
    }
}

fn complete_nodes(locations: &Locations, local_node: &NodeId) -> HashSet<NodeId> {
    locations
        .replicas()
        .iter()
        .filter(|replica| replica.flags().complete && !replica.contains_node(local_node))
        .flat_map(|replica| replica.nodes().iter().cloned())
        .collect()
}

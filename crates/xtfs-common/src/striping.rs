//! Striping policies: mapping byte offsets to objects and objects to nodes.
//!
//! A file is cut into fixed-size objects. Within one replica the objects are
//! distributed over `width` nodes; the policy decides which node index holds
//! which object. RAID0 is the only policy today:
//!
//! ```text
//! object_of(offset)     = offset / stripe_size
//! first_byte(object)    = object * stripe_size
//! last_byte(object)     = first_byte(object + 1) - 1
//! node_index_of(object) = object mod width
//! ```

use crate::error::{XtfsError, XtfsResult};

/// Where a byte sub-range lives inside one object on one node.
///
/// `first_byte` and `last_byte` are offsets relative to the start of the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeInfo {
    /// Object holding the range.
    pub object_number: u64,
    /// Index of the owning node within the replica.
    pub node_index: usize,
    /// First byte of the range inside the object.
    pub first_byte: u64,
    /// Last byte (inclusive) of the range inside the object.
    pub last_byte: u64,
}

/// RAID0 striping: objects are assigned round-robin across `width` nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Raid0 {
    stripe_size: u64,
    width: u32,
}

impl Raid0 {
    /// Create a RAID0 policy with `stripe_size` bytes per object over `width` nodes.
    pub fn new(stripe_size: u64, width: u32) -> XtfsResult<Self> {
        if stripe_size == 0 {
            return Err(XtfsError::invalid_argument("stripe size must be positive"));
        }
        if width == 0 {
            return Err(XtfsError::invalid_argument("stripe width must be positive"));
        }
        Ok(Self { stripe_size, width })
    }

    /// Bytes per object.
    pub fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    /// Number of nodes one replica is striped over.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Object containing `offset`.
    pub fn object_of(&self, offset: u64) -> u64 {
        offset / self.stripe_size
    }

    /// First file byte stored in `object`.
    pub fn first_byte(&self, object: u64) -> u64 {
        object.saturating_mul(self.stripe_size)
    }

    /// Last file byte stored in `object`.
    pub fn last_byte(&self, object: u64) -> u64 {
        self.first_byte(object).saturating_add(self.stripe_size - 1)
    }

    /// Index of the node within the replica that owns `object`.
    pub fn node_index_of(&self, object: u64) -> usize {
        (object % u64::from(self.width)) as usize
    }

    /// Stripe row of `object` (how many full rounds over the nodes precede it).
    pub fn row_of(&self, object: u64) -> u64 {
        object / u64::from(self.width)
    }

    /// Describe the byte range `[first, last]` in terms of stripe objects.
    ///
    /// Only the first and the last touched object are reported; objects in
    /// between are not enumerated.
    pub fn objects_for_range(&self, first: u64, last: u64) -> Vec<StripeInfo> {
        if first > last {
            return Vec::new();
        }
        let first_obj = self.object_of(first);
        let last_obj = self.object_of(last);

        let head = StripeInfo {
            object_number: first_obj,
            node_index: self.node_index_of(first_obj),
            first_byte: first - self.first_byte(first_obj),
            last_byte: if first_obj == last_obj {
                last - self.first_byte(first_obj)
            } else {
                self.stripe_size - 1
            },
        };
        if first_obj == last_obj {
            return vec![head];
        }

        let tail = StripeInfo {
            object_number: last_obj,
            node_index: self.node_index_of(last_obj),
            first_byte: 0,
            last_byte: last - self.first_byte(last_obj),
        };
        vec![head, tail]
    }

    /// Last object of a file of `file_size` bytes, `None` for an empty file.
    pub fn last_object_for_size(&self, file_size: u64) -> Option<u64> {
        file_size.checked_sub(1).map(|last| self.object_of(last))
    }

    /// Objects in `[first_obj, last_obj]` owned by the node at `node_index`.
    pub fn objects_of_node(
        &self,
        node_index: usize,
        first_obj: u64,
        last_obj: u64,
    ) -> impl Iterator<Item = u64> {
        let width = u64::from(self.width);
        let idx = node_index as u64;
        let start = if idx < width {
            let rem = first_obj % width;
            let offset = if rem <= idx { idx } else { width + idx };
            (first_obj - rem).checked_add(offset)
        } else {
            None
        };
        // an out-of-range node index or a start past u64::MAX owns nothing
        let range = match start {
            Some(start) => start..=last_obj,
            None => 1..=0,
        };
        range.step_by(width as usize)
    }
}

/// Striping policy of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripingPolicy {
    /// Round-robin striping without redundancy.
    Raid0(Raid0),
}

impl StripingPolicy {
    /// Convenience constructor for a RAID0 policy.
    pub fn raid0(stripe_size: u64, width: u32) -> XtfsResult<Self> {
        Raid0::new(stripe_size, width).map(StripingPolicy::Raid0)
    }

    /// Policy name as stored in the metadata service.
    pub fn name(&self) -> &'static str {
        match self {
            StripingPolicy::Raid0(_) => "RAID0",
        }
    }

    /// Number of nodes one replica is striped over.
    pub fn width(&self) -> u32 {
        match self {
            StripingPolicy::Raid0(p) => p.width(),
        }
    }

    /// Size in bytes of `object`.
    pub fn stripe_size_for_object(&self, _object: u64) -> u64 {
        match self {
            StripingPolicy::Raid0(p) => p.stripe_size(),
        }
    }

    /// Object containing `offset`.
    pub fn object_of(&self, offset: u64) -> u64 {
        match self {
            StripingPolicy::Raid0(p) => p.object_of(offset),
        }
    }

    /// First file byte stored in `object`.
    pub fn first_byte(&self, object: u64) -> u64 {
        match self {
            StripingPolicy::Raid0(p) => p.first_byte(object),
        }
    }

    /// Last file byte stored in `object`.
    pub fn last_byte(&self, object: u64) -> u64 {
        match self {
            StripingPolicy::Raid0(p) => p.last_byte(object),
        }
    }

    /// Index of the node within the replica that owns `object`.
    pub fn node_index_of(&self, object: u64) -> usize {
        match self {
            StripingPolicy::Raid0(p) => p.node_index_of(object),
        }
    }

    /// Stripe row of `object`.
    pub fn row_of(&self, object: u64) -> u64 {
        match self {
            StripingPolicy::Raid0(p) => p.row_of(object),
        }
    }

    /// See [`Raid0::objects_for_range`].
    pub fn objects_for_range(&self, first: u64, last: u64) -> Vec<StripeInfo> {
        match self {
            StripingPolicy::Raid0(p) => p.objects_for_range(first, last),
        }
    }

    /// Last object of a file of `file_size` bytes, `None` for an empty file.
    pub fn last_object_for_size(&self, file_size: u64) -> Option<u64> {
        match self {
            StripingPolicy::Raid0(p) => p.last_object_for_size(file_size),
        }
    }

    /// Objects in `[first_obj, last_obj]` owned by the node at `node_index`.
    pub fn objects_of_node(
        &self,
        node_index: usize,
        first_obj: u64,
        last_obj: u64,
    ) -> impl Iterator<Item = u64> {
        match self {
            StripingPolicy::Raid0(p) => p.objects_of_node(node_index, first_obj, last_obj),
        }
    }
}

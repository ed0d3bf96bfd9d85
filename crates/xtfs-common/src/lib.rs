#![warn(missing_docs)]

//! XtFS common subsystem: striping policies, replica locations, OSD availability
//!
//! This crate holds the placement arithmetic shared by every OSD: how file
//! byte offsets map to stripe objects, which node of a replica owns an
//! object, and which remote nodes are currently backed off after failures.

pub mod availability;
pub mod error;
pub mod location;
pub mod striping;
pub mod types;

pub use availability::{AvailabilityConfig, AvailabilityReaper, ServiceAvailability};
pub use error::{XtfsError, XtfsResult};
pub use location::{Location, Locations, ReplicaFlags, ReplicaUpdatePolicy, TransferStrategyKind};
pub use striping::{Raid0, StripeInfo, StripingPolicy};
pub use types::{Capability, CowPolicy, FileId, NodeId};

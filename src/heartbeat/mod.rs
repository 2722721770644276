//! Liveness beats, the role flags they announce, and the election engine
//! that decides them.

mod beat_map;
mod beats;

pub use beat_map::BeatMap;
pub use beats::{evaluate, Beats};

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::node::Node;

/// A liveness and role announcement, gossiped to every peer at the heartbeat
/// cadence. Never mutated after creation; superseded by the next beat from
/// the same node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beat {
    /// The announcing node.
    #[serde(flatten)]
    pub node: Node,
    /// Whether the sender considers itself the Coordinator.
    pub coordinator: bool,
    /// Whether the sender considers itself the Feasible Coordinator.
    pub feasible: bool,
    /// Sender wall-clock time at creation. Used only for per-sender
    /// freshness and remote-peer age-out.
    pub timestamp: DateTime<Utc>,
}

impl Beat {
    /// Builds a beat for this node carrying its current role flags.
    pub fn fresh(node: &Node, roles: &Roles) -> Self {
        Beat {
            node: node.clone(),
            coordinator: roles.coordinator(),
            feasible: roles.feasible(),
            timestamp: Utc::now(),
        }
    }

    /// ID of the announcing node.
    pub fn id(&self) -> i64 {
        self.node.id
    }
}

/// This node's current roles. The only process-wide mutable state: written
/// by the coordinate task at evaluation ticks, read by the supervisor and by
/// beat construction. Readers may observe stale values; the election scheme
/// tolerates that, so plain atomic loads and stores suffice.
#[derive(Debug, Default)]
pub struct Roles {
    coordinator: AtomicBool,
    feasible: AtomicBool,
}

impl Roles {
    /// Whether this node currently holds the Coordinator role.
    pub fn coordinator(&self) -> bool {
        self.coordinator.load(Ordering::Relaxed)
    }

    /// Whether this node currently holds the Feasible Coordinator role.
    pub fn feasible(&self) -> bool {
        self.feasible.load(Ordering::Relaxed)
    }

    /// Whether this node holds either role. Leaders run tighter loops.
    pub fn is_leader(&self) -> bool {
        self.coordinator() || self.feasible()
    }

    /// Records the outcome of a role evaluation.
    pub fn store(&self, coordinator: bool, feasible: bool) {
        self.coordinator.store(coordinator, Ordering::Relaxed);
        self.feasible.store(feasible, Ordering::Relaxed);
    }
}

/// Message sent by every supervised task on its buffered status channel.
/// Anything other than `Normal` terminates the process.
#[derive(Debug)]
pub enum RoutineStatus {
    /// The routine was healthy as of `timestamp`.
    Normal {
        /// When the routine checked in.
        timestamp: Instant,
    },
    /// The routine failed and is about to exit.
    Failed {
        /// What went wrong.
        error: anyhow::Error,
    },
}

impl RoutineStatus {
    /// A check-in stamped with the current time.
    pub fn normal() -> Self {
        RoutineStatus::Normal {
            timestamp: Instant::now(),
        }
    }

    /// A fatal report.
    pub fn failed(error: anyhow::Error) -> Self {
        RoutineStatus::Failed { error }
    }
}

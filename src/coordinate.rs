//! The coordinate task: tracks peer beats and runs role elections.
//!
//! Sole owner of the [`BeatMap`]. Between ticks it folds received beats into
//! the map; at each tick it ages out silent peers, evaluates the election
//! against a snapshot that always includes a synthetic self-beat, and stores
//! the outcome in the shared role flags.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::heartbeat::{evaluate, Beat, BeatMap, Roles, RoutineStatus};
use crate::node::Node;

/// Tick while holding a role: leaders need a tight control loop.
const LEADER_TICK: Duration = Duration::from_secs(5);
/// Tick while holding no role.
const FOLLOWER_TICK: Duration = Duration::from_secs(30);

/// Spawns the coordinate task and returns its status channel.
pub fn spawn(
    beats: mpsc::Receiver<Beat>,
    node: Node,
    roles: Arc<Roles>,
) -> mpsc::Receiver<RoutineStatus> {
    let (status_tx, status_rx) = mpsc::channel(10);
    tokio::spawn(run(beats, node, roles, status_tx));
    status_rx
}

async fn run(
    mut beats: mpsc::Receiver<Beat>,
    node: Node,
    roles: Arc<Roles>,
    status_tx: mpsc::Sender<RoutineStatus>,
) {
    let mut known = BeatMap::new();
    loop {
        let tick = time::sleep(if roles.is_leader() {
            LEADER_TICK
        } else {
            FOLLOWER_TICK
        });
        tokio::pin!(tick);
        loop {
            tokio::select! {
                () = &mut tick => break,
                received = beats.recv() => match received {
                    Some(beat) => known.insert(beat),
                    None => {
                        let _ = status_tx
                            .send(RoutineStatus::failed(anyhow::anyhow!("beat stream closed")))
                            .await;
                        return;
                    }
                },
            }
        }

        debug!("aging out nodes");
        known.age_out();

        let (was_coord, was_feas) = (roles.coordinator(), roles.feasible());
        let mut snapshot = known.to_beats();
        // The gossiped copy of our own beat may carry stale flags; the
        // synthetic one is authoritative.
        snapshot.upsert(Beat::fresh(&node, &roles));
        let (coordinator, feasible) = evaluate(&snapshot, was_coord, was_feas, node.id);
        roles.store(coordinator, feasible);

        if (coordinator, feasible) != (was_coord, was_feas) {
            info!(coordinator, feasible, "roles changed");
        }
        debug!(peers = known.len(), coordinator, feasible, "evaluated nodes");

        if status_tx.send(RoutineStatus::normal()).await.is_err() {
            return;
        }
    }
}

//! The supervisor: watches the liveness of every long-running routine and
//! publishes this node's heartbeat.
//!
//! The supervisor is the sole decision point for process termination. Any
//! non-normal routine status, any routine silent for longer than the
//! timeout, and any failure to publish the node's own beat all end the
//! process.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{self, Instant};
use tracing::debug;

use crate::heartbeat::{Beat, Roles, RoutineStatus};
use crate::node::Node;
use crate::publish::{Message, Publish};

/// Wait between rounds while holding a role.
const LEADER_TICK: Duration = Duration::from_secs(5);
/// Wait between rounds while holding no role.
const FOLLOWER_TICK: Duration = Duration::from_secs(30);
/// A routine silent for longer than this has timed out.
const ROUTINE_TIMEOUT: Duration = Duration::from_secs(120);
/// Deadline for publishing the supervisor's own heartbeat.
const BEAT_DEADLINE: Duration = Duration::from_secs(10);

/// Liveness bookkeeping for one supervised routine.
pub struct Routine {
    name: &'static str,
    status: mpsc::Receiver<RoutineStatus>,
    last_checkin: Instant,
}

impl Routine {
    /// Starts watching a routine through its status channel.
    pub fn new(name: &'static str, status: mpsc::Receiver<RoutineStatus>) -> Self {
        Routine {
            name,
            status,
            last_checkin: Instant::now(),
        }
    }

    /// Drains all buffered status messages and judges the routine. The
    /// channel is FIFO, so overwriting `last_checkin` on every normal
    /// message leaves the most recent check-in.
    fn check(&mut self) -> anyhow::Result<()> {
        loop {
            match self.status.try_recv() {
                Ok(RoutineStatus::Normal { timestamp }) => self.last_checkin = timestamp,
                Ok(RoutineStatus::Failed { error }) => return Err(error),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => bail!("routine exited without reporting"),
            }
        }
        let silence = self.last_checkin.elapsed();
        if silence > ROUTINE_TIMEOUT {
            bail!("timed out ({silence:?} since last check-in)");
        }
        Ok(())
    }
}

/// Runs the supervision loop until something fatal surfaces, then returns
/// the fatal error for `main` to report and exit on.
pub async fn run(
    mut routines: Vec<Routine>,
    node: Node,
    roles: Arc<Roles>,
    publish: Publish,
) -> anyhow::Error {
    loop {
        time::sleep(if roles.is_leader() {
            LEADER_TICK
        } else {
            FOLLOWER_TICK
        })
        .await;

        for routine in &mut routines {
            if let Err(error) = routine.check() {
                return error.context(format!("from routine {}", routine.name));
            }
        }
        debug!("all routines healthy");

        let beat = Beat::fresh(&node, &roles);
        if let Err(error) = publish
            .publish(Instant::now() + BEAT_DEADLINE, Message::Beat(beat))
            .await
        {
            return anyhow!(error).context("could not publish supervisor heartbeat");
        }
    }
}

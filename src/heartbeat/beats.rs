//! Aggregate calculations over a snapshot of beats, including the role
//! election decision.

use super::Beat;

/// A snapshot of the most recent beat from each known peer, including this
/// node. Input to [`evaluate`].
#[derive(Debug, Clone, Default)]
pub struct Beats(Vec<Beat>);

impl From<Vec<Beat>> for Beats {
    fn from(beats: Vec<Beat>) -> Self {
        Beats(beats)
    }
}

impl Beats {
    /// Inserts `beat`, replacing any existing beat from the same node.
    pub fn upsert(&mut self, beat: Beat) {
        match self.0.iter_mut().find(|b| b.id() == beat.id()) {
            Some(existing) => *existing = beat,
            None => self.0.push(beat),
        }
    }

    /// Whether the snapshot holds a beat for `id`.
    pub fn contains(&self, id: i64) -> bool {
        self.0.iter().any(|b| b.id() == id)
    }

    fn coord_count(&self) -> usize {
        self.0.iter().filter(|b| b.coordinator).count()
    }

    fn feas_count(&self) -> usize {
        self.0.iter().filter(|b| b.feasible).count()
    }

    /// Lowest ID among nodes claiming the Coordinator role.
    fn best_active_coord(&self) -> Option<i64> {
        self.0.iter().filter(|b| b.coordinator).map(Beat::id).min()
    }

    /// Lowest ID among nodes claiming the Feasible Coordinator role.
    fn best_active_feas(&self) -> Option<i64> {
        self.0.iter().filter(|b| b.feasible).map(Beat::id).min()
    }

    /// Lowest ID among non-Coordinators: the best candidate for the Feasible
    /// Coordinator role.
    fn best_feas(&self) -> Option<i64> {
        self.0.iter().filter(|b| !b.coordinator).map(Beat::id).min()
    }
}

/// Decides whether this node should hold the Coordinator and Feasible
/// Coordinator roles, given the current snapshot and the roles it holds now.
///
/// Pure and deterministic; ties break towards the lowest node ID. The
/// Coordinator question is settled before the Feasible one, so a demoted
/// Coordinator does not immediately compete for the standby slot — that
/// two-phase structure damps role flapping across flaky links. One-way
/// message loss between two peers can still cause flapping.
///
/// # Panics
///
/// Panics if `beats` holds no beat for `self_id`: deciding roles without our
/// own beat in the snapshot would be meaningless.
pub fn evaluate(beats: &Beats, is_coord: bool, is_feas: bool, self_id: i64) -> (bool, bool) {
    assert!(
        beats.contains(self_id),
        "beat snapshot is missing this node (id {self_id})"
    );

    // Settle the Coordinator role first.
    if beats.coord_count() == 0 {
        if is_feas && beats.best_feas() == Some(self_id) {
            // No Coordinator exists; the lowest-ID standby promotes itself.
            return (true, false);
        }
    } else if is_coord {
        // Contested coordination: only the lowest ID keeps the role, and the
        // losers drop both flags to re-earn Feasible on a later pass.
        return if beats.best_active_coord() == Some(self_id) {
            (true, false)
        } else {
            (false, false)
        };
    }

    // Then the Feasible Coordinator role.
    if beats.feas_count() == 0 {
        if beats.best_feas() == Some(self_id) {
            return (false, true);
        }
    } else if is_feas {
        return if beats.best_active_feas() == Some(self_id) {
            (false, true)
        } else {
            (false, false)
        };
    }

    (false, false)
}

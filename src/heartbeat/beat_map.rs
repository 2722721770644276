//! Per-process cache of the latest beat seen from each peer.

use std::collections::HashMap;

use chrono::{Duration, Utc};

use super::{Beat, Beats};

/// How long a node may go unheard before it is ignored. A compromise between
/// the risk of creating network partitions and the risk of missing failed
/// checks that require alerting.
const MAX_BEAT_AGE_SECS: i64 = 21;

/// The most recent beat per peer, keyed by node ID. Confined to the
/// coordinate task; holds at most one entry per node.
#[derive(Debug, Default)]
pub struct BeatMap(HashMap<i64, Beat>);

impl BeatMap {
    /// An empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `beat` as the latest for its node, replacing any previous
    /// entry. Delivery on the beat stream is per-sender FIFO, so an
    /// unconditional overwrite keeps the most recent beat.
    pub fn insert(&mut self, beat: Beat) {
        self.0.insert(beat.id(), beat);
    }

    /// Removes beats that have not been refreshed in the last 21 seconds.
    pub fn age_out(&mut self) {
        let cutoff = Utc::now() - Duration::seconds(MAX_BEAT_AGE_SECS);
        self.0.retain(|_, beat| beat.timestamp >= cutoff);
    }

    /// The current snapshot as input for the election engine.
    pub fn to_beats(&self) -> Beats {
        Beats::from(self.0.values().cloned().collect::<Vec<_>>())
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

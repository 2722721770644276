//! Identity of this process within the fleet.

use std::net::IpAddr;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

/// Failure to assemble this node's identity. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The host's externally usable address could not be determined.
    #[error("failed to discover an external IP address: {0}")]
    AddressDiscovery(#[from] local_ip_address::Error),
}

/// One process in the fleet: a random 63-bit ID, the externally visible
/// address, and a human-readable label. Built once at startup and never
/// mutated.
///
/// IDs are assumed unique across the fleet; with 200 nodes the collision
/// probability is about 2.1e-15.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Random non-negative 63-bit identifier.
    pub id: i64,
    /// Externally visible IPv4/IPv6 address.
    pub eip: IpAddr,
    /// Human-readable label, taken from the host name.
    pub name: String,
}

/// Assembles this node's identity. Address discovery failure is fatal: a
/// node that cannot be named in alerts is not worth running.
pub fn initialise() -> Result<Node, NodeError> {
    let eip = local_ip_address::local_ip()?;
    let name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_owned());
    Ok(Node {
        id: random_id(),
        eip,
        name,
    })
}

/// Draws an ID uniformly from `[0, 2^63)`.
fn random_id() -> i64 {
    rand::thread_rng().gen_range(0..i64::MAX)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_id_is_non_negative() {
        for _ in 0..1000 {
            assert!(random_id() >= 0);
        }
    }

    #[test]
    fn node_json_round_trips() {
        let node = Node {
            id: 1_000_000_000_000_000_000,
            eip: "10.0.0.1".parse().unwrap(),
            name: "test_node_1".to_owned(),
        };
        let encoded = serde_json::to_string(&node).unwrap();
        let decoded: Node = serde_json::from_str(&encoded).unwrap();
        assert_eq!(node, decoded);
    }
}

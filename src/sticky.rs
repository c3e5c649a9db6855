//! Rendezvous (highest-random-weight) hashing for sticky cron jobs (§4.6).
//!
//! Zeroconf publication/discovery itself is out of scope (§1); this module
//! owns the piece that actually has invariants worth testing: given the
//! current peer set (however it was discovered), pick the same node on
//! every member of the cluster for the same sticky source bytes.

use std::collections::HashMap;

/// One known peer: its address hash (stand-in for the real network address,
/// since address resolution lives outside this crate) and its published
/// weight (`weight=` TXT record, default `1.0`).
#[derive(Debug, Clone, Copy)]
struct Peer {
    address_hash: u32,
    weight: f64,
}

/// Tracks the cluster's published peers and answers rendezvous-hash queries
/// for sticky job routing.
#[derive(Debug, Default)]
pub struct StickyManager {
    local_node: String,
    peers: HashMap<String, Peer>,
}

impl StickyManager {
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
            peers: HashMap::new(),
        }
    }

    /// Registers or updates a peer (called from the Zeroconf membership
    /// callback; §4.6 "cluster membership callback triggers a filter
    /// update").
    pub fn upsert_peer(&mut self, node_name: &str, address: &[u8], weight_txt: Option<&str>) {
        let weight = get_weight_from_txt(weight_txt);
        self.peers.insert(
            node_name.to_string(),
            Peer {
                address_hash: fnv1a32(address),
                weight,
            },
        );
    }

    pub fn remove_peer(&mut self, node_name: &str) {
        self.peers.remove(node_name);
    }

    /// Picks the node responsible for `sticky`, returning its name and
    /// whether it is this node.
    pub fn select(&self, sticky: &[u8]) -> Option<(String, bool)> {
        if self.peers.is_empty() {
            return None;
        }

        let mut best: Option<(&str, f64)> = None;
        for (name, peer) in &self.peers {
            let score = calculate_rendezvous_score(sticky, peer.address_hash, peer.weight);
            if best.is_none_or(|(_, best_score)| score > best_score) {
                best = Some((name, score));
            }
        }

        best.map(|(name, _)| (name.to_string(), name == self.local_node))
    }

    pub fn is_local(&self, sticky: &[u8]) -> bool {
        self.select(sticky).is_some_and(|(_, is_us)| is_us)
    }
}

/// FNV-1a, 32-bit variant: chosen over DJB for its better distribution when
/// addresses share prefixes or sticky sources are short integers (§4.6).
fn fnv1a32(data: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &byte in data {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Hashes `sticky` together with `address_hash` and converts the 32-bit
/// digest to a double in `(0, 1]`, preserving as many high bits as fit in
/// the mantissa (§4.6).
fn uint_to_double(value: u32) -> f64 {
    let numerator = (value as f64) + 1.0;
    let denominator = (u32::MAX as f64) + 1.0;
    numerator / denominator
}

/// `score = (-weight) / ln(U)`, `U ∈ (0,1]` (§4.6). Larger score wins, which
/// favors both higher weight and smaller `U` since `ln(U) ≤ 0`.
fn calculate_rendezvous_score(sticky: &[u8], address_hash: u32, weight: f64) -> f64 {
    let mut combined = Vec::with_capacity(sticky.len() + 4);
    combined.extend_from_slice(sticky);
    combined.extend_from_slice(&address_hash.to_le_bytes());
    let u = uint_to_double(fnv1a32(&combined));
    -weight / u.ln()
}

/// Parses a `weight=` TXT record value, defaulting to `1.0` on absence or
/// malformed input (§4.6).
fn get_weight_from_txt(txt: Option<&str>) -> f64 {
    txt.and_then(|s| s.parse::<f64>().ok())
        .filter(|w| w.is_finite() && *w > 0.0)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a32_matches_known_vector() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn selection_is_deterministic_across_calls() {
        let mut manager = StickyManager::new("node-a");
        manager.upsert_peer("node-a", b"10.0.0.1", None);
        manager.upsert_peer("node-b", b"10.0.0.2", Some("2.0"));
        manager.upsert_peer("node-c", b"10.0.0.3", None);

        let first = manager.select(b"sticky-key-1");
        let second = manager.select(b"sticky-key-1");
        assert_eq!(first, second);
    }

    #[test]
    fn empty_peer_set_selects_nothing() {
        let manager = StickyManager::new("node-a");
        assert_eq!(manager.select(b"x"), None);
        assert!(!manager.is_local(b"x"));
    }

    #[test]
    fn default_weight_is_one_on_missing_or_bad_txt() {
        assert_eq!(get_weight_from_txt(None), 1.0);
        assert_eq!(get_weight_from_txt(Some("not-a-number")), 1.0);
        assert_eq!(get_weight_from_txt(Some("-3")), 1.0);
        assert_eq!(get_weight_from_txt(Some("2.5")), 2.5);
    }

    #[test]
    fn higher_weight_increases_score_for_same_hash_inputs() {
        let low = calculate_rendezvous_score(b"key", 42, 1.0);
        let high = calculate_rendezvous_score(b"key", 42, 5.0);
        assert!(high > low);
    }
}

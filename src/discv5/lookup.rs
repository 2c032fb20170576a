use crate::discv5::server::{ALPHA, Discovery, FIND_NODE_RESULT_LIMIT, LOOKUP_REQUEST_LIMIT};
use crate::types::Node;
use crate::utils::log_distance;
use ethereum_types::H256;
use rustc_hash::FxHashSet;
use tokio::task::JoinSet;
use tracing::trace;

/// The bucket distances a peer is asked for when looking up `target`:
/// starting from `log_distance(target, peer)`, supplemented alternately with
/// the next-higher and next-lower distance until the list has
/// [`LOOKUP_REQUEST_LIMIT`] entries.
pub fn lookup_distances(target: &H256, peer_id: &H256) -> Vec<u64> {
    let base = log_distance(target, peer_id);
    let mut distances = vec![base];
    let mut step = 1u64;
    while distances.len() < LOOKUP_REQUEST_LIMIT {
        let mut extended = false;
        if base + step < 256 {
            distances.push(base + step);
            extended = true;
        }
        if distances.len() < LOOKUP_REQUEST_LIMIT && base > step {
            distances.push(base - step);
            extended = true;
        }
        if !extended {
            break;
        }
        step += 1;
    }
    distances
}

/// Iterative Kademlia traversal toward `target`: keeps up to [`ALPHA`]
/// queries in flight, consumes completions in arrival order, and returns up
/// to `k` closest nodes sorted by XOR distance.
pub(crate) async fn run(handle: Discovery, target: H256, k: usize) -> Vec<Node> {
    let local_id = handle.local_node_id();
    let mut result: Vec<Node> = handle.neighbours(target, k).await;
    let mut seen: FxHashSet<H256> = result.iter().map(|n| n.node_id()).collect();
    seen.insert(local_id);
    let mut asked: FxHashSet<H256> = FxHashSet::default();
    asked.insert(local_id);

    let mut pending: JoinSet<Vec<Node>> = JoinSet::new();
    loop {
        let mut candidates: Vec<Node> = result
            .iter()
            .filter(|n| !asked.contains(&n.node_id()))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| (a.node_id() ^ target).cmp(&(b.node_id() ^ target)));
        for node in candidates {
            if pending.len() >= ALPHA {
                break;
            }
            asked.insert(node.node_id());
            pending.spawn(worker(handle.clone(), node, target));
        }

        let Some(joined) = pending.join_next().await else {
            break;
        };
        for node in joined.unwrap_or_default() {
            if seen.insert(node.node_id()) && result.len() < k {
                result.push(node);
            }
        }
    }

    result.sort_by(|a, b| (a.node_id() ^ target).cmp(&(b.node_id() ^ target)));
    result
}

/// Queries one peer for up to [`LOOKUP_REQUEST_LIMIT`] distances around the
/// target, offering everything it learns to the routing table.
async fn worker(handle: Discovery, peer: Node, target: H256) -> Vec<Node> {
    let mut found: Vec<Node> = Vec::new();
    for distance in lookup_distances(&target, &peer.node_id()) {
        if found.len() >= FIND_NODE_RESULT_LIMIT {
            break;
        }
        let records = handle.find_node_records(&peer, distance).await;
        if records.is_empty() {
            continue;
        }
        handle.offer_records(records.clone()).await;
        for record in &records {
            if found.len() >= FIND_NODE_RESULT_LIMIT {
                break;
            }
            if let Ok(node) = Node::from_enr(record) {
                found.push(node);
            }
        }
    }
    trace!(peer = %peer, found = found.len(), "lookup worker finished");
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_at_distance(base: &H256, distance: u64) -> H256 {
        if distance == 0 {
            return *base;
        }
        let mut bytes = *base.as_fixed_bytes();
        let bit = distance - 1;
        let byte = 31 - (bit / 8) as usize;
        bytes[byte] ^= 1 << (bit % 8);
        H256::from(bytes)
    }

    #[test]
    fn distances_fan_out_around_the_base() {
        let target = H256::zero();
        assert_eq!(
            lookup_distances(&target, &id_at_distance(&target, 128)),
            vec![128, 129, 127]
        );
        assert_eq!(
            lookup_distances(&target, &id_at_distance(&target, 1)),
            vec![1, 2, 3]
        );
        // 256 is only ever the starting distance
        assert_eq!(
            lookup_distances(&target, &id_at_distance(&target, 256)),
            vec![256, 255, 254]
        );
        assert_eq!(
            lookup_distances(&target, &id_at_distance(&target, 255)),
            vec![255, 254, 253]
        );
        // a peer that IS the target is asked for itself first
        assert_eq!(lookup_distances(&target, &target), vec![0, 1, 2]);
    }

    #[test]
    fn distances_are_distinct() {
        let target = H256::from_low_u64_be(77);
        for d in [1u64, 2, 100, 200, 255, 256] {
            let distances = lookup_distances(&target, &id_at_distance(&target, d));
            let mut unique = distances.clone();
            unique.sort_unstable();
            unique.dedup();
            assert_eq!(unique.len(), distances.len(), "duplicates for base {d}");
            assert_eq!(distances[0], d);
        }
    }
}

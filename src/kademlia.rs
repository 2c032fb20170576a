use crate::types::{Node, NodeRecord};
use crate::utils::log_distance;
use ethereum_types::H256;
use std::collections::VecDeque;

/// Maximum number of live nodes per bucket (`k`).
pub const BUCKET_SIZE: usize = 16;
/// One bucket per possible logarithmic distance (1..=256).
const BUCKET_COUNT: usize = 256;
/// Maximum number of replacement candidates kept per bucket.
const REPLACEMENT_CACHE_SIZE: usize = BUCKET_SIZE;

/// A routing-table resident: the node plus the signed record it was learned
/// from, when one is available.
#[derive(Debug, Clone)]
pub struct Contact {
    pub node: Node,
    pub record: Option<NodeRecord>,
    node_id: H256,
}

impl Contact {
    pub fn new(node: Node, record: Option<NodeRecord>) -> Self {
        let node_id = node.node_id();
        Self {
            node,
            record,
            node_id,
        }
    }

    pub fn node_id(&self) -> H256 {
        self.node_id
    }
}

#[derive(Debug, Clone, Default)]
struct Bucket {
    /// Least-recently-seen at the head, most-recently-seen at the tail.
    entries: Vec<Contact>,
    /// Bounded FIFO of candidates waiting for a slot; oldest at the front.
    replacements: VecDeque<Contact>,
}

/// Logarithmic-distance routing table: 256 buckets of up to [`BUCKET_SIZE`]
/// nodes each, indexed by `log_distance(local_id, node_id)`.
#[derive(Debug)]
pub struct KademliaTable {
    local_node_id: H256,
    buckets: Vec<Bucket>,
    revalidation_cursor: usize,
}

impl KademliaTable {
    pub fn new(local_node_id: H256) -> Self {
        Self {
            local_node_id,
            buckets: vec![Bucket::default(); BUCKET_COUNT],
            revalidation_cursor: 0,
        }
    }

    pub fn local_node_id(&self) -> H256 {
        self.local_node_id
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.entries.is_empty())
    }

    pub fn get(&self, node_id: &H256) -> Option<&Contact> {
        let bucket = self.bucket_for(node_id)?;
        bucket.entries.iter().find(|c| c.node_id == *node_id)
    }

    pub fn contains(&self, node_id: &H256) -> bool {
        self.get(node_id).is_some()
    }

    /// Offers a node to the table. A node already resident is moved to the
    /// most-recently-seen position (and its record upgraded if `record` is
    /// newer); a node in a bucket with room is appended; otherwise it is
    /// pushed onto the bucket's replacement cache, dropping the oldest
    /// candidate when the cache is full. Returns true if the node is a bucket
    /// resident afterwards.
    pub fn add(&mut self, node: Node, record: Option<NodeRecord>) -> bool {
        let node_id = node.node_id();
        let distance = log_distance(&self.local_node_id, &node_id);
        if distance == 0 {
            return false;
        }
        let bucket = &mut self.buckets[(distance - 1) as usize];

        if let Some(position) = bucket.entries.iter().position(|c| c.node_id == node_id) {
            let mut existing = bucket.entries.remove(position);
            if supersedes(&record, &existing.record) {
                existing.node = node;
                existing.record = record;
            }
            bucket.entries.push(existing);
            return true;
        }

        let contact = Contact::new(node, record);
        if bucket.entries.len() < BUCKET_SIZE {
            bucket.entries.push(contact);
            return true;
        }

        let cached = bucket
            .replacements
            .iter()
            .position(|c| c.node_id == node_id)
            .and_then(|position| bucket.replacements.remove(position));
        if let Some(mut existing) = cached {
            if supersedes(&contact.record, &existing.record) {
                existing = contact;
            }
            bucket.replacements.push_back(existing);
        } else {
            bucket.replacements.push_back(contact);
            if bucket.replacements.len() > REPLACEMENT_CACHE_SIZE {
                bucket.replacements.pop_front();
            }
        }
        false
    }

    /// Removes a node from its bucket and promotes the newest replacement
    /// candidate to the most-recently-seen position.
    pub fn remove(&mut self, node_id: &H256) -> Option<Contact> {
        let distance = log_distance(&self.local_node_id, node_id);
        if distance == 0 {
            return None;
        }
        let bucket = &mut self.buckets[(distance - 1) as usize];
        let position = bucket.entries.iter().position(|c| c.node_id == *node_id)?;
        let removed = bucket.entries.remove(position);
        if let Some(replacement) = bucket.replacements.pop_back() {
            bucket.entries.push(replacement);
        }
        Some(removed)
    }

    /// Moves a node to the most-recently-seen position of its bucket.
    pub fn set_just_seen(&mut self, node_id: &H256) {
        let Some(bucket) = self.bucket_for_mut(node_id) else {
            return;
        };
        if let Some(position) = bucket.entries.iter().position(|c| c.node_id == *node_id) {
            let contact = bucket.entries.remove(position);
            bucket.entries.push(contact);
        }
    }

    /// The `count` nodes closest to `target` by XOR distance, scanning buckets
    /// in expanding distance order around the target's bucket.
    pub fn neighbours(&self, target: &H256, count: usize) -> Vec<Node> {
        let mut candidates: Vec<&Contact> = Vec::new();
        for index in self.expanding_bucket_order(target) {
            candidates.extend(self.buckets[index].entries.iter());
        }
        candidates.sort_by(|a, b| (a.node_id ^ *target).cmp(&(b.node_id ^ *target)));
        candidates
            .into_iter()
            .take(count)
            .map(|c| c.node.clone())
            .collect()
    }

    /// All contacts in the bucket at `distance` (1..=256).
    pub fn contacts_at_distance(&self, distance: u64) -> Vec<Contact> {
        if distance == 0 || distance > BUCKET_COUNT as u64 {
            return Vec::new();
        }
        self.buckets[(distance - 1) as usize].entries.clone()
    }

    /// The least-recently-seen node of a bucket chosen in round-robin order,
    /// or none if the table is empty.
    pub fn node_to_revalidate(&mut self) -> Option<Node> {
        for offset in 0..BUCKET_COUNT {
            let index = (self.revalidation_cursor + offset) % BUCKET_COUNT;
            if let Some(contact) = self.buckets[index].entries.first() {
                self.revalidation_cursor = (index + 1) % BUCKET_COUNT;
                return Some(contact.node.clone());
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.entries.iter())
    }

    fn bucket_for(&self, node_id: &H256) -> Option<&Bucket> {
        let distance = log_distance(&self.local_node_id, node_id);
        if distance == 0 {
            return None;
        }
        Some(&self.buckets[(distance - 1) as usize])
    }

    fn bucket_for_mut(&mut self, node_id: &H256) -> Option<&mut Bucket> {
        let distance = log_distance(&self.local_node_id, node_id);
        if distance == 0 {
            return None;
        }
        Some(&mut self.buckets[(distance - 1) as usize])
    }

    /// Bucket indexes ordered by how close their distance is to the target's
    /// bucket: d, d+1, d-1, d+2, …
    fn expanding_bucket_order(&self, target: &H256) -> impl Iterator<Item = usize> {
        let start = log_distance(&self.local_node_id, target).max(1) as usize;
        let mut order = Vec::with_capacity(BUCKET_COUNT);
        order.push(start - 1);
        for step in 1..BUCKET_COUNT {
            if start + step <= BUCKET_COUNT {
                order.push(start + step - 1);
            }
            if start > step {
                order.push(start - step - 1);
            }
        }
        order.into_iter()
    }
}

/// Whether `incoming` should replace `existing`: a record never loses to a
/// missing one, and a lower sequence number never replaces a higher one.
fn supersedes(incoming: &Option<NodeRecord>, existing: &Option<NodeRecord>) -> bool {
    match (incoming, existing) {
        (Some(new), Some(old)) => new.seq > old.seq,
        (Some(_), None) => true,
        _ => false,
    }
}

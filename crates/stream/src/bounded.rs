//! Bounded memories keyed by message hash. Both keep insertion order in a
//! queue next to the lookup structure and evict from the front once over
//! capacity, so memory stays flat no matter how long a feed runs.

use std::collections::{HashMap, HashSet, VecDeque};

/// Message hashes whose lifecycle has finished (confirmed or invalidated).
/// Late pending deliveries for a remembered hash are suppressed.
#[derive(Debug)]
pub struct FinishedHashSet {
    members: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl FinishedHashSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            members: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn insert(&mut self, hash: &str) {
        if self.members.contains(hash) {
            return;
        }
        self.members.insert(hash.to_string());
        self.order.push_back(hash.to_string());
        while self.members.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.members.contains(hash)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.members.len()
    }
}

/// Remembers which addresses each pending message hash was last delivered
/// for, so a later invalidation that carries only the hash can still be
/// routed to the right watchers.
#[derive(Debug)]
pub struct HashAddressMemory {
    entries: HashMap<String, Vec<String>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl HashAddressMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn remember(&mut self, hash: &str, addresses: Vec<String>) {
        if self.entries.insert(hash.to_string(), addresses).is_none() {
            self.order.push_back(hash.to_string());
        }
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    pub fn forget(&mut self, hash: &str) {
        if self.entries.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
    }

    pub fn addresses(&self, hash: &str) -> Option<&[String]> {
        self.entries.get(hash).map(Vec::as_slice)
    }
}

// src/core/storage/engine/leaf_cache.rs

//! Residency bookkeeping for file-backed leaves.
//!
//! The cache does not hold event buffers itself; the leaves do. It only
//! remembers which leaves currently have their buffer in memory, how many
//! events each holds, and in which order they were last used. When the total
//! goes over capacity, [`LeafCache::touch`] hands back the least recently used
//! leaves for the caller to evict.

use crate::core::common::NodeId;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct LeafCache {
    capacity_events: usize,
    resident_events: usize,
    recency: VecDeque<NodeId>, // front = most recently used
    sizes: HashMap<NodeId, usize>,
}

impl LeafCache {
    pub fn new(capacity_events: usize) -> Self {
        Self {
            capacity_events,
            resident_events: 0,
            recency: VecDeque::new(),
            sizes: HashMap::new(),
        }
    }

    pub const fn capacity_events(&self) -> usize {
        self.capacity_events
    }

    pub const fn resident_events(&self) -> usize {
        self.resident_events
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.sizes.contains_key(&id)
    }

    /// Marks `id` as most recently used with `n_events` in memory and returns
    /// the leaves to evict, least recently used first, with their sizes.
    ///
    /// `id` itself is never returned. Victims are forgotten by the cache; hand
    /// one back with [`LeafCache::restore`] if it could not be evicted.
    pub fn touch(&mut self, id: NodeId, n_events: usize) -> Vec<(NodeId, usize)> {
        if let Some(old) = self.sizes.insert(id, n_events) {
            self.resident_events -= old;
            self.recency.retain(|&other| other != id);
        }
        self.resident_events += n_events;
        self.recency.push_front(id);

        let mut victims = Vec::new();
        while self.resident_events > self.capacity_events {
            match self.recency.back().copied() {
                Some(victim) if victim != id => {
                    self.recency.pop_back();
                    let size = self.sizes.remove(&victim).unwrap_or(0);
                    self.resident_events -= size;
                    victims.push((victim, size));
                }
                // Only the touched leaf is left.
                _ => break,
            }
        }
        victims
    }

    /// Updates the size of `id` without changing its recency (an untracked leaf
    /// enters as most recently used) and returns the leaves to evict, `id` included.
    pub fn resize(&mut self, id: NodeId, n_events: usize) -> Vec<(NodeId, usize)> {
        match self.sizes.insert(id, n_events) {
            Some(old) => self.resident_events -= old,
            None => self.recency.push_front(id),
        }
        self.resident_events += n_events;

        let mut victims = Vec::new();
        while self.resident_events > self.capacity_events {
            let Some(victim) = self.recency.pop_back() else {
                break;
            };
            let size = self.sizes.remove(&victim).unwrap_or(0);
            self.resident_events -= size;
            victims.push((victim, size));
        }
        victims
    }

    /// Forgets `id`, e.g. after it was evicted or split. Returns its size if it was tracked.
    pub fn remove(&mut self, id: NodeId) -> Option<usize> {
        let size = self.sizes.remove(&id)?;
        self.resident_events -= size;
        self.recency.retain(|&other| other != id);
        Some(size)
    }

    /// Puts back a victim that could not be evicted, as most recently used.
    pub fn restore(&mut self, id: NodeId, n_events: usize) {
        if self.sizes.insert(id, n_events).is_none() {
            self.resident_events += n_events;
            self.recency.push_front(id);
        }
    }

    /// Tracked leaves, most recently used first.
    pub fn resident_ids(&self) -> Vec<NodeId> {
        self.recency.iter().copied().collect()
    }

    pub fn clear(&mut self) {
        self.recency.clear();
        self.sizes.clear();
        self.resident_events = 0;
    }
}

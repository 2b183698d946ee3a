//! Dedup Cache
//!
//! Targets already handed to subscribers. Entries are keyed by
//! generation-tagged [`NodeId`]s, so a node that was removed and whose slot
//! got reused never aliases an old entry. Bounded by size and TTL with
//! explicit eviction, oldest first.

use std::collections::{HashMap, VecDeque};

use fco_dom::{NodeId, TreeAccess};

/// Size/TTL-bounded set of processed targets
#[derive(Debug)]
pub struct DedupCache {
    entries: HashMap<NodeId, u64>,
    /// Insertion order; pairs whose timestamp no longer matches `entries` are stale
    order: VecDeque<(NodeId, u64)>,
    max_entries: usize,
    ttl_ms: u64,
    evictions: u64,
}

impl DedupCache {
    pub fn new(max_entries: usize, ttl_ms: u64) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_entries: max_entries.max(1),
            ttl_ms,
            evictions: 0,
        }
    }

    /// Record `node` as processed at `now`
    pub fn insert(&mut self, node: NodeId, now: u64) {
        if self.entries.insert(node, now) == Some(now) {
            return;
        }
        self.order.push_back((node, now));

        while self.entries.len() > self.max_entries {
            if !self.pop_oldest() {
                break;
            }
        }
        if self.order.len() > self.max_entries * 2 {
            self.compact();
        }
    }

    fn pop_oldest(&mut self) -> bool {
        while let Some((node, at)) = self.order.pop_front() {
            if self.entries.get(&node) == Some(&at) {
                self.entries.remove(&node);
                self.evictions += 1;
                return true;
            }
        }
        false
    }

    fn compact(&mut self) {
        let mut live: Vec<(NodeId, u64)> = self.entries.iter().map(|(&n, &t)| (n, t)).collect();
        live.sort_by_key(|&(node, at)| (at, node));
        self.order = live.into();
    }

    fn is_fresh(&self, at: u64, now: u64) -> bool {
        self.ttl_ms == 0 || now.saturating_sub(at) < self.ttl_ms
    }

    /// Processed and not yet expired
    pub fn contains(&self, node: NodeId, now: u64) -> bool {
        self.entries
            .get(&node)
            .is_some_and(|&at| self.is_fresh(at, now))
    }

    /// `node` or one of its ancestors was processed
    pub fn contains_self_or_ancestor<T: TreeAccess + ?Sized>(
        &self,
        tree: &T,
        node: NodeId,
        now: u64,
        max_hops: usize,
    ) -> bool {
        let mut cursor = Some(node);
        let mut hops = 0;
        while let Some(current) = cursor {
            if self.contains(current, now) {
                return true;
            }
            if hops >= max_hops {
                break;
            }
            cursor = tree.parent(current);
            hops += 1;
        }
        false
    }

    pub fn remove(&mut self, node: NodeId) -> bool {
        self.entries.remove(&node).is_some()
    }

    /// Drop expired entries; returns how many went
    pub fn evict_expired(&mut self, now: u64) -> usize {
        let mut evicted = 0;
        while let Some(&(node, at)) = self.order.front() {
            if self.is_fresh(at, now) {
                break;
            }
            self.order.pop_front();
            if self.entries.get(&node) == Some(&at) {
                self.entries.remove(&node);
                evicted += 1;
            }
        }
        self.evictions += evicted as u64;
        evicted
    }

    /// Drop entries for nodes no longer in the tree
    pub fn purge_detached<T: TreeAccess + ?Sized>(&mut self, tree: &T) -> usize {
        let before = self.entries.len();
        self.entries.retain(|&node, _| tree.contains(node));
        let purged = before - self.entries.len();
        if purged > 0 {
            self.compact();
            self.evictions += purged as u64;
        }
        purged
    }

    /// Forget everything; returns how many entries were held
    pub fn clear(&mut self) -> usize {
        let len = self.entries.len();
        self.entries.clear();
        self.order.clear();
        len
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries removed by TTL, size pressure or detachment
    pub fn evictions(&self) -> u64 {
        self.evictions
    }
}

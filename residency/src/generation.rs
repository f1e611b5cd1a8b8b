//! Generational aging of resident resources.
//!
//! Instead of ordering every resource by an exact last-use timestamp, resources are bucketed
//! into `max_generation + 1` generations. A touch moves a resource back to generation 0 and
//! every aging pass moves untouched resources one generation older, so finding eviction
//! candidates is a walk from the oldest bucket down.
//!
//! Each bucket is an intrusive doubly linked list threaded through the node table, which
//! keeps insert, remove and bucket moves O(1) while preserving the order in which
//! resources entered a bucket. The head of a bucket is the entry which has sat there
//! longest.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

#[derive(Debug, Clone)]
struct Node<K> {
    generation: u8,
    prev: Option<K>,
    next: Option<K>,
    /// Set by a touch, cleared by the next aging pass which then skips advancing the node
    touched: bool,
    /// Position inside the flat scan list
    scan_index: usize,
}

#[derive(Debug, Clone, Copy)]
struct Bucket<K> {
    head: Option<K>,
    tail: Option<K>,
    len: usize,
}

impl<K> Default for Bucket<K> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }
}

/// Summary of one aging pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AgingReport {
    pub visited: usize,
    pub advanced: usize,
}

/// Eviction candidates picked by [`GenerationTable::collect`], oldest first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectPlan<K> {
    pub victims: Vec<(K, u64)>,
    pub reclaimed: u64,
}

impl<K> Default for CollectPlan<K> {
    fn default() -> Self {
        Self {
            victims: Vec::new(),
            reclaimed: 0,
        }
    }
}

#[derive(Debug)]
pub struct GenerationTable<K: Copy + Eq + Hash + Debug> {
    max_generation: u8,
    nodes: HashMap<K, Node<K>>,
    buckets: Vec<Bucket<K>>,
    /// Every tracked key exactly once, walked round-robin by aging passes
    scan: Vec<K>,
    cursor: usize,
}

impl<K: Copy + Eq + Hash + Debug> GenerationTable<K> {
    pub fn new(max_generation: u8) -> Self {
        Self {
            max_generation,
            nodes: HashMap::new(),
            buckets: vec![Bucket::default(); max_generation as usize + 1],
            scan: Vec::new(),
            cursor: 0,
        }
    }

    pub fn max_generation(&self) -> u8 {
        self.max_generation
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: K) -> bool {
        self.nodes.contains_key(&key)
    }

    pub fn generation_of(&self, key: K) -> Option<u8> {
        self.nodes.get(&key).map(|node| node.generation)
    }

    pub fn bucket_len(&self, generation: u8) -> usize {
        self.buckets
            .get(generation as usize)
            .map_or(0, |bucket| bucket.len)
    }

    /// Number of tracked keys per generation, youngest first
    pub fn histogram(&self) -> Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.len).collect()
    }

    fn push_back(&mut self, generation: u8, key: K) {
        let bucket = &mut self.buckets[generation as usize];
        let old_tail = bucket.tail.replace(key);
        if bucket.head.is_none() {
            bucket.head = Some(key);
        }
        bucket.len += 1;
        if let Some(old_tail) = old_tail {
            if let Some(tail_node) = self.nodes.get_mut(&old_tail) {
                tail_node.next = Some(key);
            }
        }
        if let Some(node) = self.nodes.get_mut(&key) {
            node.generation = generation;
            node.prev = old_tail;
            node.next = None;
        }
    }

    fn unlink(&mut self, key: K) {
        let Some((generation, prev, next)) = self
            .nodes
            .get_mut(&key)
            .map(|node| (node.generation, node.prev.take(), node.next.take()))
        else {
            return;
        };
        match prev {
            Some(prev) => {
                if let Some(prev_node) = self.nodes.get_mut(&prev) {
                    prev_node.next = next;
                }
            }
            None => self.buckets[generation as usize].head = next,
        }
        match next {
            Some(next) => {
                if let Some(next_node) = self.nodes.get_mut(&next) {
                    next_node.prev = prev;
                }
            }
            None => self.buckets[generation as usize].tail = prev,
        }
        let bucket = &mut self.buckets[generation as usize];
        bucket.len = bucket.len.saturating_sub(1);
    }

    /// Start tracking `key` in generation 0. Returns false if it was already tracked
    pub fn insert(&mut self, key: K) -> bool {
        if self.nodes.contains_key(&key) {
            return false;
        }
        self.nodes.insert(
            key,
            Node {
                generation: 0,
                prev: None,
                next: None,
                // a fresh entry was just used, let it survive the next aging pass
                touched: true,
                scan_index: self.scan.len(),
            },
        );
        self.scan.push(key);
        self.push_back(0, key);
        true
    }

    /// Stop tracking `key`, returning the generation it was in
    pub fn remove(&mut self, key: K) -> Option<u8> {
        self.unlink(key);
        let node = self.nodes.remove(&key)?;
        self.scan.swap_remove(node.scan_index);
        if let Some(moved) = self.scan.get(node.scan_index).copied() {
            if let Some(moved_node) = self.nodes.get_mut(&moved) {
                moved_node.scan_index = node.scan_index;
            }
        }
        if self.cursor >= self.scan.len() {
            self.cursor = 0;
        }
        Some(node.generation)
    }

    /// Move `key` from `old_generation` into the back of `new_generation` (capped at the
    /// maximum). Returns false if `key` is untracked or not in `old_generation`
    pub fn update_generation(&mut self, key: K, old_generation: u8, new_generation: u8) -> bool {
        match self.nodes.get(&key) {
            Some(node) if node.generation == old_generation => {}
            _ => return false,
        }
        self.unlink(key);
        self.push_back(new_generation.min(self.max_generation), key);
        true
    }

    /// Reset `key` to generation 0, making it the most recently used entry
    pub fn touch(&mut self, key: K) -> bool {
        let Some(generation) = self.nodes.get_mut(&key).map(|node| {
            node.touched = true;
            node.generation
        }) else {
            return false;
        };
        self.update_generation(key, generation, 0)
    }

    /// Age up to `batch` tracked entries (all of them when `None`) by one generation,
    /// continuing from where the previous pass stopped. Entries touched since they were
    /// last visited keep their generation for this pass
    pub fn advance_generations(&mut self, batch: Option<usize>) -> AgingReport {
        let len = self.scan.len();
        let mut report = AgingReport::default();
        if len == 0 {
            return report;
        }
        let visits = batch.unwrap_or(len).min(len);
        for _ in 0..visits {
            let key = self.scan[self.cursor];
            self.cursor = (self.cursor + 1) % len;
            report.visited += 1;

            let Some(node) = self.nodes.get_mut(&key) else {
                continue;
            };
            if std::mem::take(&mut node.touched) {
                continue;
            }
            let generation = node.generation;
            if generation < self.max_generation
                && self.update_generation(key, generation, generation + 1)
            {
                report.advanced += 1;
            }
        }
        report
    }

    /// Tracked keys from the oldest generation down, oldest entry of each bucket first
    pub fn oldest_first(&self) -> OldestFirst<'_, K> {
        OldestFirst {
            table: self,
            generation: Some(self.max_generation),
            next: self.buckets[self.max_generation as usize].head,
        }
    }

    /// Pick eviction candidates, oldest first, until at least `overage` bytes are reclaimed.
    ///
    /// `can_unload` returns the reclaimable size of an eligible key, or `None` when the key
    /// is pinned. The plan may reclaim less than `overage` when too little is eligible
    pub fn collect<F>(&self, overage: u64, mut can_unload: F) -> CollectPlan<K>
    where
        F: FnMut(K) -> Option<u64>,
    {
        let mut plan = CollectPlan::default();
        if overage == 0 {
            return plan;
        }
        for key in self.oldest_first() {
            if let Some(size) = can_unload(key) {
                plan.victims.push((key, size));
                plan.reclaimed += size;
                if plan.reclaimed >= overage {
                    break;
                }
            }
        }
        plan
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.scan.clear();
        self.cursor = 0;
        for bucket in self.buckets.iter_mut() {
            *bucket = Bucket::default();
        }
    }

    /// Verify every tracked key sits in exactly one bucket and in the scan list exactly once
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        let mut seen = HashMap::with_capacity(self.nodes.len());
        for (generation, bucket) in self.buckets.iter().enumerate() {
            let mut count = 0;
            let mut prev = None;
            let mut cursor = bucket.head;
            while let Some(key) = cursor {
                let node = self
                    .nodes
                    .get(&key)
                    .ok_or_else(|| anyhow::anyhow!("{key:?} linked in bucket {generation} but untracked"))?;
                anyhow::ensure!(
                    node.generation as usize == generation,
                    "{key:?} records generation {} but sits in bucket {generation}",
                    node.generation
                );
                anyhow::ensure!(node.prev == prev, "{key:?} has a broken back link");
                anyhow::ensure!(
                    seen.insert(key, generation).is_none(),
                    "{key:?} appears in more than one bucket"
                );
                count += 1;
                prev = Some(key);
                cursor = node.next;
            }
            anyhow::ensure!(bucket.tail == prev, "bucket {generation} tail is stale");
            anyhow::ensure!(
                bucket.len == count,
                "bucket {generation} reports {} entries but links {count}",
                bucket.len
            );
        }
        anyhow::ensure!(
            seen.len() == self.nodes.len(),
            "{} tracked keys but {} linked",
            self.nodes.len(),
            seen.len()
        );
        anyhow::ensure!(self.scan.len() == self.nodes.len(), "scan list out of sync");
        for (index, key) in self.scan.iter().enumerate() {
            let node = self
                .nodes
                .get(key)
                .ok_or_else(|| anyhow::anyhow!("{key:?} scanned but untracked"))?;
            anyhow::ensure!(node.scan_index == index, "{key:?} has a stale scan index");
        }
        Ok(())
    }
}

pub struct OldestFirst<'a, K: Copy + Eq + Hash + Debug> {
    table: &'a GenerationTable<K>,
    generation: Option<u8>,
    next: Option<K>,
}

impl<K: Copy + Eq + Hash + Debug> Iterator for OldestFirst<'_, K> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        loop {
            if let Some(key) = self.next {
                self.next = self.table.nodes.get(&key).and_then(|node| node.next);
                return Some(key);
            }
            let generation = self.generation?;
            if generation == 0 {
                self.generation = None;
                return None;
            }
            self.generation = Some(generation - 1);
            self.next = self.table.buckets[generation as usize - 1].head;
        }
    }
}

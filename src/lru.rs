// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 evring contributors
//
// Time-indexed LRU cache. One arena slot per entry carries the list links
// (recency order), the bucket-chain link, and the cached hash, so lookup,
// insert, touch and erase are all O(1) with a single allocation-per-entry
// amortised into the slab.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::time::{Duration, Instant};

use slab::Slab;

const NIL: usize = usize::MAX;

/// Opaque handle to a live cache entry.
///
/// Handles are invalidated by `erase` (including eviction through
/// `clear_expired`); using a stale handle afterwards is a programmer
/// error, caught by a debug assertion where possible.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EntryRef(usize);

struct Node<K, V> {
    key: K,
    value: V,
    deadline: Instant,
    hash: u64,
    prev: usize,
    next: usize,
    hash_next: usize,
}

/// Key/value store with O(1) lookup and most-recently-used-at-tail
/// ordering, expiring entries a fixed timeout after their last insert or
/// touch.
///
/// Because every entry's deadline is `last activity + timeout` with one
/// constant timeout, the recency list is also deadline-sorted; bulk
/// expiry therefore stops at the first live entry and costs O(evicted).
pub struct LruCache<K, V, S = RandomState> {
    timeout: Duration,
    nodes: Slab<Node<K, V>>,
    buckets: Vec<usize>,
    head: usize,
    tail: usize,
    hasher: S,
}

const INITIAL_BUCKETS: usize = 16;

impl<K: Hash + Eq, V> LruCache<K, V> {
    /// A cache whose entries live `timeout` past their last activity.
    pub fn new(timeout: Duration) -> Self {
        Self::with_hasher(timeout, RandomState::new())
    }
}

impl<K: Hash + Eq, V, S: BuildHasher> LruCache<K, V, S> {
    pub fn with_hasher(timeout: Duration, hasher: S) -> Self {
        Self {
            timeout,
            nodes: Slab::new(),
            buckets: vec![NIL; INITIAL_BUCKETS],
            head: NIL,
            tail: NIL,
            hasher,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Current size of the bucket array (always a power of two).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    /// Look up a key without touching it. Accepts any borrowed form of the
    /// key that hashes and compares like it.
    pub fn find<Q>(&self, key: &Q) -> Option<EntryRef>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        let mut slot = self.buckets[self.bucket_of(hash)];
        while slot != NIL {
            let node = &self.nodes[slot];
            if node.hash == hash && node.key.borrow() == key {
                return Some(EntryRef(slot));
            }
            slot = node.hash_next;
        }
        None
    }

    pub fn key(&self, entry: EntryRef) -> &K {
        &self.nodes[entry.0].key
    }

    pub fn value(&self, entry: EntryRef) -> &V {
        &self.nodes[entry.0].value
    }

    pub fn value_mut(&mut self, entry: EntryRef) -> &mut V {
        &mut self.nodes[entry.0].value
    }

    pub fn deadline(&self, entry: EntryRef) -> Instant {
        self.nodes[entry.0].deadline
    }

    /// Insert `key` → `value` with deadline `now + timeout`, placing the
    /// entry at the recency tail.
    ///
    /// If an equal key already exists its entry is returned untouched
    /// (no recency move, no deadline reset) with `false`.
    pub fn insert(&mut self, now: Instant, key: K, value: V) -> (EntryRef, bool) {
        let hash = self.hasher.hash_one(&key);
        let mut slot = self.buckets[self.bucket_of(hash)];
        while slot != NIL {
            let node = &self.nodes[slot];
            if node.hash == hash && node.key == key {
                return (EntryRef(slot), false);
            }
            slot = node.hash_next;
        }

        let slot = self.nodes.insert(Node {
            key,
            value,
            deadline: now + self.timeout,
            hash,
            prev: NIL,
            next: NIL,
            hash_next: NIL,
        });
        self.link_tail(slot);
        let bucket = self.bucket_of(hash);
        self.nodes[slot].hash_next = self.buckets[bucket];
        self.buckets[bucket] = slot;

        if self.nodes.len() >= self.buckets.len() {
            self.grow_buckets();
        }
        (EntryRef(slot), true)
    }

    /// Reset the entry's deadline to `now + timeout` and move it to the
    /// recency tail.
    pub fn touch(&mut self, now: Instant, entry: EntryRef) {
        debug_assert!(self.nodes.contains(entry.0), "touch on a stale EntryRef");
        self.nodes[entry.0].deadline = now + self.timeout;
        self.unlink_list(entry.0);
        self.link_tail(entry.0);
    }

    /// Remove the entry, returning its key and value.
    pub fn erase(&mut self, entry: EntryRef) -> (K, V) {
        debug_assert!(self.nodes.contains(entry.0), "erase on a stale EntryRef");
        self.unlink_list(entry.0);
        self.unlink_bucket(entry.0);
        let node = self.nodes.remove(entry.0);
        (node.key, node.value)
    }

    /// Evict every entry whose deadline is at or before `now`, calling
    /// `visitor` with each evicted key and value. Walks from the recency
    /// head and stops at the first live entry, so the cost is
    /// proportional to the number evicted.
    pub fn clear_expired(&mut self, now: Instant, mut visitor: impl FnMut(&K, &V)) -> usize {
        let mut evicted = 0;
        while self.head != NIL {
            let slot = self.head;
            if self.nodes[slot].deadline > now {
                break;
            }
            {
                let node = &self.nodes[slot];
                visitor(&node.key, &node.value);
            }
            self.erase(EntryRef(slot));
            evicted += 1;
        }
        evicted
    }

    /// Entries in recency order, least recently used first.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter {
            cache: self,
            slot: self.head,
        }
    }

    fn link_tail(&mut self, slot: usize) {
        self.nodes[slot].prev = self.tail;
        self.nodes[slot].next = NIL;
        if self.tail != NIL {
            self.nodes[self.tail].next = slot;
        } else {
            self.head = slot;
        }
        self.tail = slot;
    }

    fn unlink_list(&mut self, slot: usize) {
        let (prev, next) = {
            let node = &self.nodes[slot];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
    }

    fn unlink_bucket(&mut self, slot: usize) {
        let bucket = self.bucket_of(self.nodes[slot].hash);
        let mut cursor = self.buckets[bucket];
        if cursor == slot {
            self.buckets[bucket] = self.nodes[slot].hash_next;
            return;
        }
        while cursor != NIL {
            let next = self.nodes[cursor].hash_next;
            if next == slot {
                self.nodes[cursor].hash_next = self.nodes[slot].hash_next;
                return;
            }
            cursor = next;
        }
        debug_assert!(false, "entry missing from its bucket chain");
    }

    /// Double the bucket array and relink every chain. Nodes stay put in
    /// the arena; only the chain links change.
    fn grow_buckets(&mut self) {
        let new_len = self.buckets.len() * 2;
        self.buckets = vec![NIL; new_len];
        let mask = new_len - 1;
        // Walk the recency list so relinking is deterministic.
        let mut slot = self.head;
        while slot != NIL {
            let next = self.nodes[slot].next;
            let bucket = (self.nodes[slot].hash as usize) & mask;
            self.nodes[slot].hash_next = self.buckets[bucket];
            self.buckets[bucket] = slot;
            slot = next;
        }
    }
}

/// Front-to-back (least recently used first) iterator.
pub struct Iter<'a, K, V, S> {
    cache: &'a LruCache<K, V, S>,
    slot: usize,
}

impl<'a, K: Hash + Eq, V, S: BuildHasher> Iterator for Iter<'a, K, V, S> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.slot == NIL {
            return None;
        }
        let node = &self.cache.nodes[self.slot];
        self.slot = node.next;
        Some((&node.key, &node.value))
    }
}

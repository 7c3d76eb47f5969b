//! Weight-bounded LRU (Least Recently Used) list
//!
//! Uses an index-linked list over a slab of nodes for O(1) promotion and
//! eviction. Not synchronized; [`RegistryCache`](crate::RegistryCache)
//! wraps it in a lock.

use std::collections::HashMap;
use std::hash::Hash;

use ahash::RandomState;
use chrono::{DateTime, Utc};

use crate::weight::Weighted;

/// Node in the LRU doubly-linked list
struct Node<K, V> {
    key: K,
    value: V,
    /// Size reported by `value` when it was stored
    weight: u64,
    accessed: DateTime<Utc>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU list bounded by the total weight of its values
pub struct LruCache<K, V> {
    map: HashMap<K, usize, RandomState>,
    nodes: Vec<Option<Node<K, V>>>,
    head: Option<usize>,
    tail: Option<usize>,
    free_list: Vec<usize>,
    size: u64,
    capacity: u64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Weighted,
{
    /// Create an empty list that holds at most `capacity` units of weight
    pub fn new(capacity: u64) -> Self {
        Self {
            map: HashMap::with_hasher(RandomState::new()),
            nodes: Vec::new(),
            head: None,
            tail: None,
            free_list: Vec::new(),
            size: 0,
            capacity,
        }
    }

    /// Look up a value and mark it most recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        self.nodes[idx].as_ref().map(|node| &node.value)
    }

    /// Insert or replace a value.
    ///
    /// Returns the number of entries evicted to get back under capacity.
    pub fn put(&mut self, key: K, value: V) -> usize {
        if let Some(&idx) = self.map.get(&key) {
            self.update_in_place(idx, value);
        } else {
            self.push_front(key, value);
        }
        self.check_capacity()
    }

    /// Insert only if `key` is absent. An existing entry is promoted but
    /// keeps its value and weight.
    pub fn put_if_absent(&mut self, key: K, value: V) -> usize {
        if let Some(&idx) = self.map.get(&key) {
            self.move_to_front(idx);
            0
        } else {
            self.push_front(key, value);
            self.check_capacity()
        }
    }

    /// Remove a key from the list
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let idx = self.map.remove(key)?;
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.free_list.push(idx);
        self.size -= node.weight;
        Some(node.value)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.map.clear();
        self.nodes.clear();
        self.free_list.clear();
        self.head = None;
        self.tail = None;
        self.size = 0;
    }

    /// Change the weight ceiling, evicting as needed.
    ///
    /// Returns the number of evicted entries.
    pub fn set_capacity(&mut self, capacity: u64) -> usize {
        self.capacity = capacity;
        self.check_capacity()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if the list is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Sum of the weights of all entries
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Weight ceiling
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Access time of the least recently used entry
    pub fn oldest_access(&self) -> Option<DateTime<Utc>> {
        let tail = self.tail?;
        self.nodes[tail].as_ref().map(|node| node.accessed)
    }

    /// Iterate entries from most to least recently used
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            nodes: &self.nodes,
            cursor: self.head,
        }
    }

    fn update_in_place(&mut self, idx: usize, value: V) {
        let weight = value.size();
        if let Some(node) = &mut self.nodes[idx] {
            // Add before subtracting so the u64 never dips below zero.
            self.size = self.size + weight - node.weight;
            node.value = value;
            node.weight = weight;
        }
        self.move_to_front(idx);
    }

    fn push_front(&mut self, key: K, value: V) {
        let weight = value.size();
        let idx = self.alloc_node();
        self.nodes[idx] = Some(Node {
            key: key.clone(),
            value,
            weight,
            accessed: Utc::now(),
            prev: None,
            next: self.head,
        });

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }

        self.map.insert(key, idx);
        self.size += weight;
    }

    fn move_to_front(&mut self, idx: usize) {
        if let Some(node) = &mut self.nodes[idx] {
            node.accessed = Utc::now();
        }

        if self.head == Some(idx) {
            return;
        }

        self.unlink(idx);

        if let Some(node) = &mut self.nodes[idx] {
            node.prev = None;
            node.next = self.head;
        }

        if let Some(head_idx) = self.head {
            if let Some(head) = &mut self.nodes[head_idx] {
                head.prev = Some(idx);
            }
        }

        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match &self.nodes[idx] {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = &mut self.nodes[prev_idx] {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(next_idx) => {
                if let Some(next_node) = &mut self.nodes[next_idx] {
                    next_node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    /// Evict from the tail until the total weight fits
    fn check_capacity(&mut self) -> usize {
        let mut evicted = 0;
        while self.size > self.capacity {
            match self.evict() {
                Some(_) => evicted += 1,
                None => break,
            }
        }
        evicted
    }

    fn evict(&mut self) -> Option<K> {
        let tail_idx = self.tail?;
        self.unlink(tail_idx);
        let node = self.nodes[tail_idx].take()?;
        self.map.remove(&node.key);
        self.free_list.push(tail_idx);
        self.size -= node.weight;
        Some(node.key)
    }

    fn alloc_node(&mut self) -> usize {
        if let Some(idx) = self.free_list.pop() {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(None);
            idx
        }
    }
}

/// Iterator over `(key, value)` pairs, most recently used first
pub struct Iter<'a, K, V> {
    nodes: &'a [Option<Node<K, V>>],
    cursor: Option<usize>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes[self.cursor?].as_ref()?;
        self.cursor = node.next;
        Some((&node.key, &node.value))
    }
}

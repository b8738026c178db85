//! Insertion-ordered list of orphaned games awaiting reclaim or deletion.
//!
//! Nodes live in an arena and link to each other by index; a key index gives
//! O(1) removal and refresh. Entries are always appended with the current time
//! so the list stays ordered oldest-first and a sweep can stop at the first
//! entry whose grace period has not elapsed.

use std::collections::HashMap;
use std::hash::Hash;
use tokio::time::Instant;

#[derive(Debug)]
struct Node<K> {
    key: K,
    since: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct ExpiryList<K> {
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<K> Default for ExpiryList<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ExpiryList<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Appends `key` stamped with `now`. A key already on the list is moved to
    /// the tail with the new timestamp.
    pub fn push_back(&mut self, key: K, now: Instant) {
        if let Some(slot) = self.index.get(&key).copied() {
            self.unlink(slot);
            if let Some(node) = self.nodes[slot].as_mut() {
                node.since = now;
            }
            self.link_back(slot);
            return;
        }

        let node = Node {
            key: key.clone(),
            since: now,
            prev: None,
            next: None,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(key, slot);
        self.link_back(slot);
    }

    pub fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                self.nodes[slot] = None;
                self.free.push(slot);
                true
            }
            None => false,
        }
    }

    /// Oldest entry and the time it was added.
    pub fn front(&self) -> Option<(&K, Instant)> {
        let slot = self.head?;
        self.nodes[slot].as_ref().map(|node| (&node.key, node.since))
    }

    pub fn pop_front(&mut self) -> Option<(K, Instant)> {
        let (key, since) = self.front().map(|(key, since)| (key.clone(), since))?;
        self.remove(&key);
        Some((key, since))
    }

    /// Keys from oldest to newest.
    #[cfg(test)]
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            match self.nodes[slot].as_ref() {
                Some(node) => {
                    keys.push(node.key.clone());
                    cursor = node.next;
                }
                None => break,
            }
        }
        keys
    }

    fn link_back(&mut self, slot: usize) {
        let old_tail = self.tail;
        if let Some(node) = self.nodes[slot].as_mut() {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(tail) => {
                if let Some(node) = self.nodes[tail].as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.nodes[slot].as_mut() {
            Some(node) => (node.prev.take(), node.next.take()),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_push_keeps_insertion_order() {
        let mut list = ExpiryList::new();
        list.push_back("a", Instant::now());
        list.push_back("b", Instant::now());
        list.push_back("c", Instant::now());

        assert_eq!(list.len(), 3);
        assert_eq!(list.keys(), vec!["a", "b", "c"]);
        assert_eq!(list.front().map(|(k, _)| *k), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_moves_to_tail() {
        let mut list = ExpiryList::new();
        let start = Instant::now();
        list.push_back("a", start);
        list.push_back("b", start);

        tokio::time::advance(Duration::from_secs(5)).await;
        list.push_back("a", Instant::now());

        assert_eq!(list.len(), 2);
        assert_eq!(list.keys(), vec!["b", "a"]);
        assert_eq!(list.front(), Some((&"b", start)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_from_middle_head_and_tail() {
        let mut list = ExpiryList::new();
        for key in ["a", "b", "c", "d"] {
            list.push_back(key, Instant::now());
        }

        assert!(list.remove(&"b"));
        assert_eq!(list.keys(), vec!["a", "c", "d"]);
        assert!(list.remove(&"a"));
        assert_eq!(list.keys(), vec!["c", "d"]);
        assert!(list.remove(&"d"));
        assert_eq!(list.keys(), vec!["c"]);
        assert!(!list.remove(&"d"));
        assert!(list.remove(&"c"));
        assert!(list.is_empty());
        assert!(list.front().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_are_reused() {
        let mut list = ExpiryList::new();
        list.push_back(1, Instant::now());
        list.push_back(2, Instant::now());
        list.remove(&1);
        list.push_back(3, Instant::now());

        assert_eq!(list.nodes.len(), 2);
        assert_eq!(list.keys(), vec![2, 3]);
        assert_eq!(list.pop_front().map(|(k, _)| k), Some(2));
        assert_eq!(list.pop_front().map(|(k, _)| k), Some(3));
        assert!(list.pop_front().is_none());
    }
}

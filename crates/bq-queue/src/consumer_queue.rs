//! Order-preserving consumer queue used for both `active` and `blocked`
//! (§3). A plain `VecDeque` makes `cancel_consumer`/`notify_channel_down`/
//! the active<->blocked transitions O(n) per operation via `.retain()`.
//! Spec §9 calls this out directly and recommends a doubly-linked list
//! keyed by channel-id with an auxiliary channel-id index; this is that
//! structure: push-back, pop-front and single-key removal are O(1), and
//! removing every entry for a dead channel is O(entries for that channel)
//! rather than O(n).

use std::collections::{HashMap, HashSet};

use bq_common::ChannelId;

use crate::record::ConsumerKey;

struct Node {
    key: ConsumerKey,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
pub struct ConsumerQueue {
    nodes: Vec<Option<Node>>,
    by_key: HashMap<ConsumerKey, usize>,
    by_channel: HashMap<ChannelId, HashSet<usize>>,
    head: Option<usize>,
    tail: Option<usize>,
    free: Vec<usize>,
}

impl ConsumerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// O(1): a dedicated count per channel-id means this never scans the
    /// list.
    pub fn has_channel(&self, channel_id: ChannelId) -> bool {
        self.by_channel.get(&channel_id).is_some_and(|s| !s.is_empty())
    }

    pub fn push_back(&mut self, key: ConsumerKey) {
        if self.by_key.contains_key(&key) {
            return;
        }
        let node = Node { key: key.clone(), prev: self.tail, next: None };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        match self.tail {
            Some(tail) => self.nodes[tail].as_mut().expect("tail is live").next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.by_channel.entry(key.channel_id).or_default().insert(idx);
        self.by_key.insert(key, idx);
    }

    pub fn pop_front(&mut self) -> Option<ConsumerKey> {
        let idx = self.head?;
        Some(self.unlink(idx))
    }

    /// O(1) removal by key, the case `.retain()` made O(n).
    pub fn remove(&mut self, key: &ConsumerKey) -> bool {
        let Some(&idx) = self.by_key.get(key) else {
            return false;
        };
        self.unlink(idx);
        true
    }

    /// O(entries for `channel_id`), not O(n): every consumer belonging to
    /// a channel that died or cancelled, removed via the auxiliary index
    /// instead of scanning the whole list.
    pub fn remove_channel(&mut self, channel_id: ChannelId) -> Vec<ConsumerKey> {
        let Some(indices) = self.by_channel.get(&channel_id).cloned() else {
            return Vec::new();
        };
        indices.into_iter().map(|idx| self.unlink(idx)).collect()
    }

    fn unlink(&mut self, idx: usize) -> ConsumerKey {
        let node = self.nodes[idx].take().expect("idx came from a live index entry");
        match node.prev {
            Some(prev) => self.nodes[prev].as_mut().expect("prev is live").next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].as_mut().expect("next is live").prev = node.prev,
            None => self.tail = node.prev,
        }
        self.by_key.remove(&node.key);
        if let Some(set) = self.by_channel.get_mut(&node.key.channel_id) {
            set.remove(&idx);
            if set.is_empty() {
                self.by_channel.remove(&node.key.channel_id);
            }
        }
        self.free.push(idx);
        node.key
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerKey> {
        let mut cur = self.head;
        std::iter::from_fn(move || {
            let idx = cur?;
            let node = self.nodes[idx].as_ref().expect("live node");
            cur = node.next;
            Some(&node.key)
        })
    }

    pub fn shrink_to_fit(&mut self) {
        self.nodes.shrink_to_fit();
        self.by_key.shrink_to_fit();
        self.by_channel.shrink_to_fit();
        self.free.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bq_common::ConsumerTag;

    fn key(channel: u64, tag: &str) -> ConsumerKey {
        ConsumerKey { channel_id: ChannelId(channel), tag: ConsumerTag(tag.to_string()) }
    }

    #[test]
    fn push_and_pop_preserve_fifo_order() {
        let mut q = ConsumerQueue::new();
        q.push_back(key(1, "a"));
        q.push_back(key(1, "b"));
        q.push_back(key(2, "c"));
        assert_eq!(q.pop_front(), Some(key(1, "a")));
        assert_eq!(q.pop_front(), Some(key(1, "b")));
        assert_eq!(q.pop_front(), Some(key(2, "c")));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn remove_by_key_unlinks_without_disturbing_order() {
        let mut q = ConsumerQueue::new();
        q.push_back(key(1, "a"));
        q.push_back(key(1, "b"));
        q.push_back(key(2, "c"));
        assert!(q.remove(&key(1, "b")));
        assert!(!q.remove(&key(1, "b")));
        assert_eq!(q.iter().cloned().collect::<Vec<_>>(), vec![key(1, "a"), key(2, "c")]);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn remove_channel_drops_every_key_for_that_channel_only() {
        let mut q = ConsumerQueue::new();
        q.push_back(key(1, "a"));
        q.push_back(key(2, "x"));
        q.push_back(key(1, "b"));
        let mut removed = q.remove_channel(ChannelId(1));
        removed.sort_by(|a, b| a.tag.0.cmp(&b.tag.0));
        assert_eq!(removed, vec![key(1, "a"), key(1, "b")]);
        assert!(!q.has_channel(ChannelId(1)));
        assert_eq!(q.iter().cloned().collect::<Vec<_>>(), vec![key(2, "x")]);
    }

    #[test]
    fn freed_slots_are_recycled_on_reinsert() {
        let mut q = ConsumerQueue::new();
        q.push_back(key(1, "a"));
        q.remove(&key(1, "a"));
        q.push_back(key(1, "b"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.iter().cloned().collect::<Vec<_>>(), vec![key(1, "b")]);
    }

    #[test]
    fn has_channel_reflects_presence_after_mixed_ops() {
        let mut q = ConsumerQueue::new();
        assert!(!q.has_channel(ChannelId(1)));
        q.push_back(key(1, "a"));
        assert!(q.has_channel(ChannelId(1)));
        q.pop_front();
        assert!(!q.has_channel(ChannelId(1)));
    }
}

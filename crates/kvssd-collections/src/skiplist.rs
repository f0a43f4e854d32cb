use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

const MAX_LEVEL: usize = 12;

struct Node<K, V> {
    key: K,
    value: V,
    /// Successor arena index per level; `next.len()` is the node height.
    next: Vec<Option<usize>>,
}

/// Ordered map over an arena of tower nodes. Iteration follows level 0, so
/// it is always in ascending key order. Levels are drawn from a seeded
/// generator so behavior is reproducible.
pub struct SkipList<K, V> {
    head: [Option<usize>; MAX_LEVEL],
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    len: usize,
    rng: SmallRng,
}

impl<K: Ord, V> SkipList<K, V> {
    pub fn new() -> Self {
        SkipList {
            head: [None; MAX_LEVEL],
            nodes: Vec::new(),
            free: Vec::new(),
            len: 0,
            rng: SmallRng::seed_from_u64(0x5eed),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, idx: usize) -> &Node<K, V> {
        self.nodes[idx].as_ref().expect("dangling skiplist index")
    }

    fn random_level(&mut self) -> usize {
        let mut level = 1;
        while level < MAX_LEVEL && self.rng.gen::<bool>() {
            level += 1;
        }
        level
    }

    /// Predecessor arena indices per level (`None` = the head tower).
    fn predecessors(&self, key: &K) -> [Option<usize>; MAX_LEVEL] {
        let mut preds = [None; MAX_LEVEL];
        let mut cur: Option<usize> = None;
        for level in (0..MAX_LEVEL).rev() {
            loop {
                let next = match cur {
                    None => self.head[level],
                    Some(idx) => self.node(idx).next.get(level).copied().flatten(),
                };
                match next {
                    Some(n) if self.node(n).key < *key => cur = Some(n),
                    _ => break,
                }
            }
            preds[level] = cur;
        }
        preds
    }

    fn next_of(&self, pred: Option<usize>, level: usize) -> Option<usize> {
        match pred {
            None => self.head[level],
            Some(idx) => self.node(idx).next.get(level).copied().flatten(),
        }
    }

    /// Insert `value` under `key`, returning the previous value when the key
    /// was already present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let preds = self.predecessors(&key);
        if let Some(hit) = self.next_of(preds[0], 0) {
            if self.node(hit).key == key {
                let node = self.nodes[hit].as_mut().unwrap();
                return Some(core::mem::replace(&mut node.value, value));
            }
        }

        let height = self.random_level();
        let mut next = Vec::with_capacity(height);
        for level in 0..height {
            next.push(self.next_of(preds[level], level));
        }

        let idx = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(Node { key, value, next });
                slot
            }
            None => {
                self.nodes.push(Some(Node { key, value, next }));
                self.nodes.len() - 1
            }
        };

        for level in 0..height {
            match preds[level] {
                None => self.head[level] = Some(idx),
                Some(p) => {
                    let pred = self.nodes[p].as_mut().unwrap();
                    if level < pred.next.len() {
                        pred.next[level] = Some(idx);
                    }
                }
            }
        }
        self.len += 1;
        None
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let preds = self.predecessors(key);
        let hit = self.next_of(preds[0], 0)?;
        let node = self.node(hit);
        (node.key == *key).then_some(&node.value)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let preds = self.predecessors(key);
        let hit = self.next_of(preds[0], 0)?;
        if self.node(hit).key != *key {
            return None;
        }
        Some(&mut self.nodes[hit].as_mut().unwrap().value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Unlink and return the value stored under `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let preds = self.predecessors(key);
        let hit = self.next_of(preds[0], 0)?;
        if self.node(hit).key != *key {
            return None;
        }
        let height = self.node(hit).next.len();
        for level in 0..height {
            let succ = self.node(hit).next[level];
            match preds[level] {
                None => {
                    if self.head[level] == Some(hit) {
                        self.head[level] = succ;
                    }
                }
                Some(p) => {
                    let pred = self.nodes[p].as_mut().unwrap();
                    if level < pred.next.len() && pred.next[level] == Some(hit) {
                        pred.next[level] = succ;
                    }
                }
            }
        }
        let node = self.nodes[hit].take().unwrap();
        self.free.push(hit);
        self.len -= 1;
        Some(node.value)
    }

    /// Ascending key-order iterator.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            list: self,
            cur: self.head[0],
        }
    }

    /// Remove every entry, yielding them in ascending key order.
    pub fn drain_ordered(&mut self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head[0];
        while let Some(idx) = cur {
            let node = self.nodes[idx].take().unwrap();
            cur = node.next[0];
            out.push((node.key, node.value));
        }
        self.head = [None; MAX_LEVEL];
        self.nodes.clear();
        self.free.clear();
        self.len = 0;
        out
    }
}

impl<K: Ord, V> Default for SkipList<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, K, V> {
    list: &'a SkipList<K, V>,
    cur: Option<usize>,
}

impl<'a, K: Ord, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.cur?;
        let node = self.list.node(idx);
        self.cur = node.next[0];
        Some((&node.key, &node.value))
    }
}

/// Max-heap that supports cheap bulk loading: `insert_append` pushes without
/// sifting, and `construct_by` re-keys every entry and heapifies in one pass.
/// The block partition manager appends blocks as segments are handed out and
/// only heapifies when a GC target is requested, so priorities are read at
/// selection time rather than insertion time.
pub struct BulkHeap<T> {
    body: Vec<(u32, T)>,
    heapified: bool,
}

impl<T> BulkHeap<T> {
    pub fn new() -> Self {
        BulkHeap {
            body: Vec::new(),
            heapified: true,
        }
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Append without restoring heap order. Call [`BulkHeap::construct_by`]
    /// before popping.
    pub fn insert_append(&mut self, item: T) {
        self.body.push((0, item));
        self.heapified = false;
    }

    /// Re-key every entry with `priority` and heapify bottom-up.
    pub fn construct_by(&mut self, priority: impl Fn(&T) -> u32) {
        for (key, item) in &mut self.body {
            *key = priority(item);
        }
        if self.body.len() > 1 {
            for idx in (0..self.body.len() / 2).rev() {
                self.sift_down(idx);
            }
        }
        self.heapified = true;
    }

    /// Largest-key entry. Panics when called on a bulk-loaded heap that has
    /// not been constructed yet.
    pub fn pop_max(&mut self) -> Option<(u32, T)> {
        assert!(self.heapified, "bulk heap popped before construct");
        if self.body.is_empty() {
            return None;
        }
        let last = self.body.len() - 1;
        self.body.swap(0, last);
        let out = self.body.pop().unwrap();
        if !self.body.is_empty() {
            self.sift_down(0);
        }
        Some(out)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.body.iter().map(|(_, t)| t)
    }

    pub fn clear(&mut self) {
        self.body.clear();
        self.heapified = true;
    }

    fn sift_down(&mut self, mut idx: usize) {
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut largest = idx;
            if left < self.body.len() && self.body[left].0 > self.body[largest].0 {
                largest = left;
            }
            if right < self.body.len() && self.body[right].0 > self.body[largest].0 {
                largest = right;
            }
            if largest == idx {
                break;
            }
            self.body.swap(idx, largest);
            idx = largest;
        }
    }
}

impl<T> Default for BulkHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

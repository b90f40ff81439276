//! Indexable binary min-heap.
//!
//! Ordered by ascending priority (earliest deadline first). Every element is
//! told its slot on each move, so an acknowledged or requeued message can be
//! pulled out of the middle of the heap in O(log n) instead of waiting for it
//! to reach the root.
//!
//! Backing storage grows geometrically and shrinks by half once it is less
//! than a quarter full.

use std::sync::Arc;

use super::message::Message;

/// An element that can live in a [`PriorityQueue`].
pub trait HeapItem {
    fn priority(&self) -> i64;
    /// Record the element's current slot, or -1 when it leaves the heap.
    fn set_index(&self, index: isize);
}

impl HeapItem for Arc<Message> {
    fn priority(&self) -> i64 {
        Message::priority(self)
    }

    fn set_index(&self, index: isize) {
        Message::set_index(self, index)
    }
}

const MIN_SHRINK_CAPACITY: usize = 25;

#[derive(Debug)]
pub struct PriorityQueue<T: HeapItem> {
    items: Vec<T>,
}

impl<T: HeapItem> PriorityQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn push(&mut self, item: T) {
        let n = self.items.len();
        item.set_index(n as isize);
        self.items.push(item);
        self.up(n);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.items.is_empty() {
            return None;
        }
        Some(self.remove(0))
    }

    /// Remove the element at slot `i`.
    ///
    /// # Panics
    /// If `i` is out of bounds.
    pub fn remove(&mut self, i: usize) -> T {
        let item = self.items.swap_remove(i);
        item.set_index(-1);

        if i < self.items.len() {
            self.items[i].set_index(i as isize);
            // the element moved into `i` may belong above or below it
            if !self.down(i) {
                self.up(i);
            }
        }

        self.maybe_shrink();
        item
    }

    /// Pop the root if its priority is `<= max`.
    pub fn peek_and_shift(&mut self, max: i64) -> Option<T> {
        match self.items.first() {
            Some(root) if root.priority() <= max => self.pop(),
            _ => None,
        }
    }

    /// Remove everything, clearing each element's slot.
    pub fn drain(&mut self) -> Vec<T> {
        let items: Vec<T> = self.items.drain(..).collect();
        for item in &items {
            item.set_index(-1);
        }
        items
    }

    fn maybe_shrink(&mut self) {
        let cap = self.items.capacity();
        if cap > MIN_SHRINK_CAPACITY && self.items.len() < cap / 4 {
            self.items.shrink_to(cap / 2);
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        self.items[i].set_index(i as isize);
        self.items[j].set_index(j as isize);
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.items[i].priority() < self.items[j].priority()
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less(j, parent) {
                break;
            }
            self.swap(parent, j);
            j = parent;
        }
    }

    /// Sift down from `i0`; returns whether the element moved.
    fn down(&mut self, i0: usize) -> bool {
        let n = self.items.len();
        let mut i = i0;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                child = right;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > i0
    }
}

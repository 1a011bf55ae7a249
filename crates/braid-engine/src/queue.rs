use std::cmp::Ordering;
use std::fmt;

type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Binary min-heap ordered by a caller-supplied comparator.
///
/// The element comparing `Less` than every other is popped first.
pub struct PriorityQueue<T> {
    heap: Vec<T>,
    cmp: Comparator<T>,
}

impl<T> PriorityQueue<T> {
    pub fn new(cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        Self {
            heap: Vec::new(),
            cmp: Box::new(cmp),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.first()
    }

    pub fn push(&mut self, item: T) {
        self.heap.push(item);
        self.sift_up(self.heap.len() - 1);
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.heap.swap(0, last);
        let top = self.heap.pop();
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        top
    }

    /// Remove every element, in no particular order.
    pub fn drain(&mut self) -> Vec<T> {
        std::mem::take(&mut self.heap)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        (self.cmp)(&self.heap[a], &self.heap[b]) == Ordering::Less
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.less(idx, parent) {
                break;
            }
            self.heap.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut smallest = idx;
            if left < len && self.less(left, smallest) {
                smallest = left;
            }
            if right < len && self.less(right, smallest) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.heap.swap(idx, smallest);
            idx = smallest;
        }
    }
}

impl<T: Ord> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new(|a: &T, b: &T| a.cmp(b))
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("len", &self.heap.len())
            .field("top", &self.heap.first())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pops_in_ascending_order() {
        let mut q = PriorityQueue::default();
        for n in [5, 1, 9, 3, 7, 2, 8] {
            q.push(n);
        }
        assert_eq!(q.len(), 7);
        assert_eq!(q.peek(), Some(&1));

        let mut out = Vec::new();
        while let Some(n) = q.pop() {
            out.push(n);
        }
        assert_eq!(out, vec![1, 2, 3, 5, 7, 8, 9]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_custom_comparator_breaks_ties() {
        // (priority, seq): lower priority first, then submission order
        let mut q = PriorityQueue::new(|a: &(u32, u64), b: &(u32, u64)| {
            a.0.cmp(&b.0).then(a.1.cmp(&b.1))
        });
        q.push((5, 0));
        q.push((1, 1));
        q.push((5, 2));
        q.push((1, 3));

        assert_eq!(q.pop(), Some((1, 1)));
        assert_eq!(q.pop(), Some((1, 3)));
        assert_eq!(q.pop(), Some((5, 0)));
        assert_eq!(q.pop(), Some((5, 2)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_max_heap_via_reversed_comparator() {
        let mut q = PriorityQueue::new(|a: &i32, b: &i32| b.cmp(a));
        q.push(1);
        q.push(3);
        q.push(2);
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut q = PriorityQueue::default();
        q.push(2);
        q.push(1);
        let mut drained = q.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }
}

/// Bucket priority queue with discrete priorities `0..n_bins`
///
/// Higher priority pops first. Push and pop are O(1) amortised, which is what
/// quality-guided unwrapping needs with 8-bit edge weights.
pub struct BucketQueue<T> {
    bins: Vec<Vec<T>>,
    // highest bin that may be non-empty
    top: usize,
    count: usize,
}

impl<T> BucketQueue<T> {
    pub fn new(n_bins: usize) -> Self {
        let n_bins = n_bins.max(1);
        BucketQueue {
            bins: (0..n_bins).map(|_| Vec::new()).collect(),
            top: 0,
            count: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Priorities above the top bin are clamped into it
    #[inline]
    pub fn push(&mut self, priority: usize, item: T) {
        let priority = priority.min(self.bins.len() - 1);
        self.bins[priority].push(item);
        self.count += 1;
        self.top = self.top.max(priority);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        while self.bins[self.top].is_empty() {
            if self.top == 0 {
                return None;
            }
            self.top -= 1;
        }
        self.count -= 1;
        self.bins[self.top].pop()
    }
}

use std::ops::Range;

/// Splits `total` elements into `parts` contiguous ranges whose sizes differ by
/// at most one. The first `total % parts` ranges get the extra element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancedSplitter {
    total: usize,
    parts: usize,
}

impl BalancedSplitter {
    /// # Panics
    /// Panics if `parts == 0`.
    pub fn new(total: usize, parts: usize) -> Self {
        assert!(parts > 0, "cannot split {} elements into 0 parts", total);
        BalancedSplitter { total, parts }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn parts(&self) -> usize {
        self.parts
    }

    /// Range owned by part `index`.
    ///
    /// # Panics
    /// Panics if `index >= parts()`.
    pub fn at(&self, index: usize) -> Range<usize> {
        assert!(
            index < self.parts,
            "part index {} out of range for {} parts",
            index,
            self.parts
        );
        let base = self.total / self.parts;
        let remainder = self.total % self.parts;
        let start = index * base + index.min(remainder);
        let len = base + usize::from(index < remainder);
        start..start + len
    }

    /// Sizes of every part, in order.
    pub fn sizes(&self) -> Vec<usize> {
        (0..self.parts).map(|i| self.at(i).len()).collect()
    }
}

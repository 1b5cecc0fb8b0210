use super::{LimitAlgorithm, Sample};

/// A simple, fixed admission limit.
#[derive(Debug, Clone, Copy)]
pub struct Fixed {
    limit: usize,
}

impl Fixed {
    /// Admit up to `limit` tokens at a time.
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);
        Self { limit }
    }
}

impl LimitAlgorithm for Fixed {
    fn initial_limit(&self) -> usize {
        self.limit
    }

    fn max_limit(&self) -> usize {
        self.limit
    }

    fn update(&self, old_limit: usize, _sample: Sample) -> usize {
        old_limit
    }
}

use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Branch {
    Left,
    Right,
}

/// Measures how long each side of a boolean operator takes over the first
/// evaluations so the operator can put the cheaper side first. It only ever
/// changes the evaluation order, never the result.
#[derive(Debug, Clone)]
pub(crate) struct BranchOptimizer {
    start: Option<Instant>,
    left: Duration,
    right: Duration,
    samples_remaining: usize,
}

impl BranchOptimizer {
    pub(crate) fn new(samples: usize) -> BranchOptimizer {
        BranchOptimizer {
            start: None,
            left: Duration::ZERO,
            right: Duration::ZERO,
            samples_remaining: samples,
        }
    }

    pub(crate) fn recording(&self) -> bool {
        self.samples_remaining > 0
    }

    pub(crate) fn start(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Attributes the time since [`start`](Self::start) to `branch`. A sample
    /// is complete once the right side is measured. Returns true if sampling
    /// just finished.
    pub(crate) fn finish(&mut self, branch: Branch) -> bool {
        let elapsed = self.start.take().map(|s| s.elapsed()).unwrap_or_default();

        match branch {
            Branch::Left => self.left += elapsed,
            Branch::Right => {
                self.right += elapsed;
                self.samples_remaining = self.samples_remaining.saturating_sub(1);
                return self.samples_remaining == 0;
            }
        }

        false
    }

    pub(crate) fn optimal_branch(&self) -> Branch {
        if self.right < self.left {
            Branch::Right
        } else {
            Branch::Left
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_recording_after_samples() {
        let mut optimizer = BranchOptimizer::new(2);

        assert!(optimizer.recording());
        optimizer.start();
        assert!(!optimizer.finish(Branch::Left));
        optimizer.start();
        assert!(!optimizer.finish(Branch::Right));
        assert!(optimizer.recording());

        optimizer.start();
        optimizer.finish(Branch::Left);
        optimizer.start();
        assert!(optimizer.finish(Branch::Right));
        assert!(!optimizer.recording());
    }

    #[test]
    fn prefers_cheaper_branch() {
        let mut optimizer = BranchOptimizer::new(1);
        optimizer.left = Duration::from_millis(5);
        optimizer.right = Duration::from_millis(1);
        assert_eq!(optimizer.optimal_branch(), Branch::Right);

        optimizer.right = Duration::from_millis(5);
        assert_eq!(optimizer.optimal_branch(), Branch::Left);
    }
}

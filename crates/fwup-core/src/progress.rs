//! Weighted, monotonic progress.
//!
//! Work is split into steps with relative weights; the current step may
//! report fractional child progress. Percentages only move forward, each
//! value is reported at most once and the last step ends on exactly 100.

/// Receives overall percentages.
pub trait ProgressSink {
    fn on_progress(&mut self, percentage: u8);
}

impl<F: FnMut(u8)> ProgressSink for F {
    fn on_progress(&mut self, percentage: u8) {
        self(percentage)
    }
}

#[derive(Debug, Clone)]
struct Step<K> {
    id: K,
    weight: u32,
}

/// Progress over a fixed list of weighted steps identified by `K`.
#[derive(Debug, Clone)]
pub struct Progress<K> {
    steps: Vec<Step<K>>,
    current: usize,
    child: (usize, usize),
    last: Option<u8>,
}

impl<K: Copy + PartialEq> Progress<K> {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            current: 0,
            child: (0, 0),
            last: None,
        }
    }

    pub fn with_step(mut self, id: K, weight: u32) -> Self {
        self.steps.push(Step { id, weight });
        self
    }

    /// Step currently in progress, `None` once all are done.
    pub fn current(&self) -> Option<K> {
        self.steps.get(self.current).map(|s| s.id)
    }

    pub fn is_finished(&self) -> bool {
        self.current >= self.steps.len()
    }

    fn total_weight(&self) -> u64 {
        self.steps.iter().map(|s| u64::from(s.weight)).sum()
    }

    /// Percentage implied by the current position, ignoring what was
    /// already reported.
    pub fn percentage(&self) -> u8 {
        let total = self.total_weight();
        if total == 0 || self.is_finished() {
            return if self.is_finished() { 100 } else { 0 };
        }
        let done: u64 = self.steps[..self.current]
            .iter()
            .map(|s| u64::from(s.weight))
            .sum();
        let (child_done, child_total) = self.child;
        let pct = if child_total == 0 {
            done * 100 / total
        } else {
            let child_total = child_total as u64;
            let weight = u64::from(self.steps[self.current].weight);
            let partial = weight * (child_done as u64).min(child_total);
            (done * 100 * child_total + partial * 100) / (total * child_total)
        };
        pct.min(100) as u8
    }

    /// Report `done / total` within the current step.
    pub fn set_child(&mut self, done: usize, total: usize) -> Option<u8> {
        if self.is_finished() {
            return None;
        }
        self.child = (done, total);
        self.emit()
    }

    /// Complete the current step and move to the next.
    pub fn step_done(&mut self) -> Option<u8> {
        if self.is_finished() {
            return None;
        }
        self.current += 1;
        self.child = (0, 0);
        self.emit()
    }

    /// Complete every remaining step.
    pub fn finish(&mut self) -> Option<u8> {
        self.current = self.steps.len();
        self.child = (0, 0);
        self.emit()
    }

    /// The new percentage if it moved past the last reported one.
    fn emit(&mut self) -> Option<u8> {
        let pct = self.percentage();
        match self.last {
            Some(last) if pct <= last => None,
            _ => {
                self.last = Some(pct);
                Some(pct)
            }
        }
    }
}

impl<K: Copy + PartialEq> Default for Progress<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum S {
        A,
        B,
        C,
    }

    #[test]
    fn test_weighted_steps() {
        let mut p = Progress::new()
            .with_step(S::A, 10)
            .with_step(S::B, 80)
            .with_step(S::C, 10);
        assert_eq!(p.step_done(), Some(10));
        assert_eq!(p.current(), Some(S::B));
        assert_eq!(p.set_child(1, 2), Some(50));
        assert_eq!(p.set_child(2, 2), Some(90));
        // completing B lands on the same value, so nothing new is reported
        assert_eq!(p.step_done(), None);
        assert_eq!(p.step_done(), Some(100));
        assert!(p.is_finished());
        assert_eq!(p.step_done(), None);
    }

    #[test]
    fn test_never_regresses() {
        let mut p = Progress::new().with_step(S::A, 1);
        assert_eq!(p.set_child(3, 4), Some(75));
        assert_eq!(p.set_child(1, 4), None);
        assert_eq!(p.percentage(), 25);
        assert_eq!(p.set_child(4, 4), Some(100));
        assert_eq!(p.finish(), None);
    }

    #[test]
    fn test_child_progress_inside_light_step() {
        let mut p = Progress::new().with_step(S::A, 1).with_step(S::B, 3);
        assert_eq!(p.set_child(1, 2), Some(12));
        assert_eq!(p.step_done(), Some(25));
        assert_eq!(p.set_child(2, 5), Some(55));
        assert_eq!(p.set_child(9, 5), Some(100));
    }

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |pct: u8| seen.push(pct);
            let mut p = Progress::new().with_step(S::A, 1).with_step(S::B, 1);
            for pct in [p.step_done(), p.step_done()].into_iter().flatten() {
                sink.on_progress(pct);
            }
        }
        assert_eq!(seen, vec![50, 100]);
    }
}

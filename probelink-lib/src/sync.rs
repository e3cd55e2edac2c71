//! Crossing from the capture domain into the control loop.
//!
//! The capture engine runs on its own clock. Anything it publishes is read
//! through a [`Synchronizer`], never directly.

/// Two-stage register chain. A value presented on step `n` is visible at the
/// output on step `n + 2`.
#[derive(Debug, Clone, Default)]
pub struct Synchronizer<T: Copy + Default> {
    first: T,
    second: T,
}

impl<T: Copy + Default> Synchronizer<T> {
    pub fn new(initial: T) -> Self {
        Self {
            first: initial,
            second: initial,
        }
    }

    /// Advance one step with `input` sampled from the other domain, returning
    /// the synchronized output for this step.
    pub fn clock(&mut self, input: T) -> T {
        let output = self.second;
        self.second = self.first;
        self.first = input;
        output
    }

    pub fn output(&self) -> T {
        self.second
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_step_delay() {
        let mut sync = Synchronizer::new(false);
        assert!(!sync.clock(true));
        assert!(!sync.clock(true));
        assert!(sync.clock(true));
        assert!(sync.output());

        assert!(sync.clock(false));
        assert!(sync.clock(false));
        assert!(!sync.clock(false));
    }

    #[test]
    fn test_multi_bit_values() {
        let mut sync = Synchronizer::<u32>::default();
        let outputs: Vec<u32> = [1, 2, 3, 4].iter().map(|v| sync.clock(*v)).collect();
        assert_eq!(outputs, vec![0, 0, 1, 2]);
    }
}

//! Learning-rate decay over a fit

/// Linear decay from an initial to a final learning rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    /// Rate at step zero
    pub initial: f64,
    /// Rate from `steps` onwards
    pub last: f64,
    /// Steps over which the rate decays
    pub steps: usize,
}

impl LearningRateSchedule {
    /// Create a new schedule ending at `lr * final_fraction`; a fraction of 1 keeps the rate constant
    #[must_use]
    pub fn new(lr: f64, final_fraction: f64, steps: usize) -> Self {
        Self {
            initial: lr,
            last: lr * final_fraction,
            steps,
        }
    }

    /// Learning rate at step `t`
    #[must_use]
    pub fn value(&self, t: usize) -> f64 {
        if t >= self.steps {
            self.last
        } else {
            self.initial + (self.last - self.initial) * (t as f64 / self.steps as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_decay() {
        let schedule = LearningRateSchedule::new(1.0, 0.0, 10);
        assert_abs_diff_eq!(schedule.value(0), 1.0);
        assert_abs_diff_eq!(schedule.value(5), 0.5);
        assert_abs_diff_eq!(schedule.value(20), 0.0);
    }

    #[test]
    fn test_unit_fraction_is_constant() {
        let schedule = LearningRateSchedule::new(0.01, 1.0, 100);
        assert_abs_diff_eq!(schedule.value(0), 0.01);
        assert_abs_diff_eq!(schedule.value(99), 0.01);
        assert_abs_diff_eq!(schedule.value(500), 0.01);
    }
}

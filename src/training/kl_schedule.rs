use burn::config::Config;

/// Linear ramp of the KL weight between two epochs
#[derive(Debug, Config)]
pub struct KlAnnealing {
    /// Weight up to and including `start_epoch`
    #[config(default = 1e-6)]
    pub start: f64,
    /// Weight from `end_epoch` on
    #[config(default = 1e-3)]
    pub end: f64,
    #[config(default = 0)]
    pub start_epoch: usize,
    #[config(default = 10)]
    pub end_epoch: usize,
}

impl Default for KlAnnealing {
    fn default() -> Self {
        Self::new()
    }
}

impl KlAnnealing {
    pub fn beta(&self, epoch: usize) -> f64 {
        if epoch <= self.start_epoch || self.end_epoch <= self.start_epoch {
            return if epoch >= self.end_epoch {
                self.end
            } else {
                self.start
            };
        }
        if epoch >= self.end_epoch {
            return self.end;
        }
        let progress =
            (epoch - self.start_epoch) as f64 / (self.end_epoch - self.start_epoch) as f64;
        self.start + (self.end - self.start) * progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_ramp() {
        let schedule = KlAnnealing::new()
            .with_start(0.0)
            .with_end(1.0)
            .with_start_epoch(2)
            .with_end_epoch(6);

        assert!((schedule.beta(0) - 0.0).abs() < 1e-12);
        assert!((schedule.beta(2) - 0.0).abs() < 1e-12);
        assert!((schedule.beta(4) - 0.5).abs() < 1e-12);
        assert!((schedule.beta(6) - 1.0).abs() < 1e-12);
        assert!((schedule.beta(100) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_range_steps() {
        let schedule = KlAnnealing::new()
            .with_start(0.1)
            .with_end(0.2)
            .with_start_epoch(3)
            .with_end_epoch(3);

        assert!((schedule.beta(2) - 0.1).abs() < 1e-12);
        assert!((schedule.beta(3) - 0.2).abs() < 1e-12);
    }
}

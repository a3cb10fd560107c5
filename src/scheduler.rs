//! Learning-Rate Schedules
//!
//! A scheduler is stepped once per optimizer step and returns the learning
//! rate to use for that step. The first call returns `base_lr`.
//!
//! ## Constant
//!
//! `lr = base_lr` throughout.
//!
//! ## Cosine annealing
//!
//! ```text
//! progress = min(step / total_steps, 1)
//! lr = base_lr * 0.5 * (1 + cos(π * progress))
//! ```
//!
//! Decays smoothly from `base_lr` to 0 and never increases.
//!
//! ## Cosine with warm restarts
//!
//! The same cosine curve, restarted at the end of each cycle. Cycle lengths
//! double (`T_mult = 2`), and the first length is chosen so that
//! `n_restarts` cycles fill the run:
//!
//! ```text
//! T_0 = max(1, total_steps / (2^n_restarts - 1))
//!
//! lr  │╲    ╲          ╲
//!     │ ╲    ╲           ╲
//!     │  ╲    ╲            ╲
//!     └───┴────────┴────────────────┴── step
//!      T_0   2·T_0       4·T_0
//! ```
//!
//! At each boundary the phase resets to 0, so the rate jumps back up.

use crate::config::LrSchedule;
use std::f64::consts::PI;

/// Restarts used to size the first cosine cycle
const N_RESTARTS: u32 = 3;

pub struct LrScheduler {
    schedule: LrSchedule,
    base_lr: f64,
    total_steps: usize,
    step: usize,
    /// First cycle length, only used for warm restarts
    t_0: usize,
}

impl LrScheduler {
    pub fn new(schedule: LrSchedule, base_lr: f64, total_steps: usize) -> Self {
        let divisor = (1usize << N_RESTARTS) - 1;
        Self {
            schedule,
            base_lr,
            total_steps,
            step: 0,
            t_0: (total_steps / divisor).max(1),
        }
    }

    /// Learning rate for the current step, without advancing
    pub fn current_lr(&self) -> f64 {
        match self.schedule {
            LrSchedule::Constant => self.base_lr,
            LrSchedule::Cosine => {
                if self.total_steps <= 1 {
                    return self.base_lr;
                }
                let progress = (self.step as f64 / self.total_steps as f64).min(1.0);
                cosine(self.base_lr, progress)
            }
            LrSchedule::CosineRestarts => {
                if self.total_steps <= 1 {
                    return self.base_lr;
                }
                let mut step = self.step;
                let mut cycle_len = self.t_0;
                while step >= cycle_len {
                    step -= cycle_len;
                    cycle_len *= 2;
                }
                cosine(self.base_lr, step as f64 / cycle_len as f64)
            }
        }
    }

    /// Return the current learning rate and advance one step
    pub fn step(&mut self) -> f64 {
        let lr = self.current_lr();
        self.step += 1;
        lr
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    pub fn schedule(&self) -> LrSchedule {
        self.schedule
    }
}

fn cosine(base_lr: f64, progress: f64) -> f64 {
    base_lr * 0.5 * (1.0 + (PI * progress).cos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(schedule: LrSchedule, total: usize, steps: usize) -> Vec<f64> {
        let mut s = LrScheduler::new(schedule, 1e-3, total);
        (0..steps).map(|_| s.step()).collect()
    }

    #[test]
    fn test_constant() {
        assert!(run(LrSchedule::Constant, 50, 50).iter().all(|&lr| lr == 1e-3));
    }

    #[test]
    fn test_cosine_endpoints_and_monotonic() {
        let lrs = run(LrSchedule::Cosine, 100, 101);
        assert_eq!(lrs[0], 1e-3);
        assert!(lrs[100].abs() < 1e-15);
        assert!(lrs.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_cosine_clamps_past_end() {
        let lrs = run(LrSchedule::Cosine, 10, 20);
        assert!(lrs[10..].iter().all(|&lr| lr.abs() < 1e-15));
    }

    #[test]
    fn test_single_step_run_keeps_base_lr() {
        assert_eq!(run(LrSchedule::Cosine, 1, 3), vec![1e-3; 3]);
        assert_eq!(run(LrSchedule::CosineRestarts, 0, 2), vec![1e-3; 2]);
    }

    #[test]
    fn test_restarts_jump_back_up() {
        let lrs = run(LrSchedule::CosineRestarts, 100, 100);
        let restarts = lrs.windows(2).filter(|w| w[1] > w[0]).count();
        assert!(restarts >= 1);
        // T_0 = 100 / 7 = 14; the second cycle starts at step 14
        assert_eq!(lrs[0], 1e-3);
        assert_eq!(lrs[14], 1e-3);
        assert!(lrs[13] < lrs[14]);
        assert_eq!(lrs[42], 1e-3);
    }

    #[test]
    fn test_step_counter() {
        let mut s = LrScheduler::new(LrSchedule::Cosine, 0.1, 10);
        s.step();
        s.step();
        assert_eq!(s.steps_taken(), 2);
        assert_eq!(s.schedule(), LrSchedule::Cosine);
    }
}

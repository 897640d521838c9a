use crate::error::ControlError;
use std::collections::VecDeque;
use std::time::Duration;

const INTERVAL_HISTORY: usize = 100;
const COMPENSATION_HISTORY: usize = 50;
const FPS_SMOOTHING_WINDOW: usize = 20;

/// Total pacing compensation is clamped to this range
const COMPENSATION_MAX: f64 = 2.5;

/// Outbound pacing controller.
///
/// Computes the inter-frame emission interval for viewers from network
/// jitter, buffer occupancy and the currently observed FPS, and decides
/// when incoming frames should be dropped outright.
#[derive(Debug)]
pub struct FrameRateController {
    pub target_fps: u32,
    pub min_fps: u32,
    pub max_fps: u32,
    current_fps: f64,
    adaptive_compensation: f64,
    frame_intervals: VecDeque<f64>,
    compensation_history: VecDeque<f64>,
}

impl FrameRateController {
    pub fn new(target_fps: u32, min_fps: u32) -> Self {
        Self {
            target_fps: target_fps.max(1),
            min_fps: min_fps.max(1),
            max_fps: target_fps.max(1),
            current_fps: target_fps.max(1) as f64,
            adaptive_compensation: 1.0,
            frame_intervals: VecDeque::with_capacity(INTERVAL_HISTORY),
            compensation_history: VecDeque::with_capacity(COMPENSATION_HISTORY),
        }
    }

    /// Optimal outbound inter-frame interval under current conditions.
    /// `buffer_utilization` is a fraction in [0, 1].
    pub fn optimal_interval(&mut self, network_jitter: f64, buffer_utilization: f64) -> Duration {
        let base_interval = 1.0 / self.target_fps as f64;

        let network_factor = 1.0 + network_jitter * 10.0;

        let buffer_factor = if buffer_utilization < 0.3 {
            1.0 + (0.3 - buffer_utilization) * 2.0
        } else if buffer_utilization > 0.8 {
            0.8
        } else {
            1.0
        };

        let fps_factor = if self.current_fps < self.min_fps as f64 {
            0.7
        } else if self.current_fps < self.target_fps as f64 * 0.8 {
            0.85
        } else {
            1.0
        };

        let mut compensation =
            (network_factor * buffer_factor * fps_factor).min(COMPENSATION_MAX);

        if !self.compensation_history.is_empty() {
            let recent: Vec<f64> = self
                .compensation_history
                .iter()
                .rev()
                .take(10)
                .cloned()
                .collect();
            let mean = recent.iter().sum::<f64>() / recent.len() as f64;
            compensation = compensation * 0.7 + mean * 0.3;
        }

        compensation = compensation.clamp(0.0, COMPENSATION_MAX);
        self.adaptive_compensation = compensation;

        if self.compensation_history.len() >= COMPENSATION_HISTORY {
            self.compensation_history.pop_front();
        }
        self.compensation_history.push_back(compensation);

        // Never pace below the minimum-FPS guarantee
        let interval = (base_interval * compensation).min(1.0 / self.min_fps as f64);
        Duration::from_secs_f64(interval)
    }

    /// Record a measured inter-arrival interval in seconds
    pub fn record_interval(&mut self, interval_secs: f64) {
        if !interval_secs.is_finite() || interval_secs <= 0.0 {
            return;
        }
        if self.frame_intervals.len() >= INTERVAL_HISTORY {
            self.frame_intervals.pop_front();
        }
        self.frame_intervals.push_back(interval_secs);
    }

    /// Refresh the smoothed FPS estimate from recent intervals, falling
    /// back to the given externally measured value.
    pub fn update_fps(&mut self, measured_fps: f64) {
        let recent: Vec<f64> = self
            .frame_intervals
            .iter()
            .rev()
            .take(FPS_SMOOTHING_WINDOW)
            .cloned()
            .collect();

        if recent.is_empty() {
            self.current_fps = measured_fps.max(0.0);
            return;
        }

        let avg_interval = recent.iter().sum::<f64>() / recent.len() as f64;
        let calculated = if avg_interval > 0.0 {
            1.0 / avg_interval
        } else {
            measured_fps
        };
        self.current_fps = self.current_fps * 0.8 + calculated * 0.2;
    }

    /// Whether an incoming frame should be dropped for pipeline health
    pub fn should_drop(&self, buffer_utilization: f64, network_jitter: f64) -> bool {
        if buffer_utilization > 0.9 {
            return true;
        }
        if network_jitter > 0.2 {
            return true;
        }
        self.current_fps < self.min_fps as f64 * 0.8
    }

    pub fn current_fps(&self) -> f64 {
        self.current_fps
    }

    pub fn compensation(&self) -> f64 {
        self.adaptive_compensation
    }

    /// Externally published compensation (from the adaptive controller)
    pub fn set_compensation(&mut self, compensation: f64) {
        if compensation.is_finite() {
            self.adaptive_compensation = compensation.clamp(0.0, COMPENSATION_MAX);
        }
    }

    /// Operator-adjustable targets; rejects inconsistent values.
    pub fn set_targets(&mut self, target_fps: u32, min_fps: u32) -> Result<(), ControlError> {
        if target_fps == 0 || min_fps == 0 || min_fps > target_fps {
            return Err(ControlError::InvalidFrameRate {
                details: format!(
                    "target_fps={} min_fps={} must satisfy 0 < min <= target",
                    target_fps, min_fps
                ),
            });
        }
        self.target_fps = target_fps;
        self.min_fps = min_fps;
        self.max_fps = self.max_fps.max(target_fps);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.frame_intervals.clear();
        self.compensation_history.clear();
        self.adaptive_compensation = 1.0;
        self.current_fps = self.target_fps as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_interval_at_nominal_conditions() {
        let mut c = FrameRateController::new(30, 15);
        let interval = c.optimal_interval(0.0, 0.5).as_secs_f64();
        // No jitter, mid buffer, healthy FPS: compensation is 1.0
        assert!((interval - 1.0 / 30.0).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_stretches_interval() {
        let mut calm = FrameRateController::new(30, 15);
        let mut rough = FrameRateController::new(30, 15);

        let calm_interval = calm.optimal_interval(0.0, 0.5);
        let rough_interval = rough.optimal_interval(0.1, 0.5);
        assert!(rough_interval > calm_interval);
    }

    #[test]
    fn test_low_buffer_stretches_high_buffer_shrinks() {
        let mut c = FrameRateController::new(30, 15);
        let starving = c.optimal_interval(0.0, 0.1).as_secs_f64();
        c.reset();
        let draining = c.optimal_interval(0.0, 0.9).as_secs_f64();

        assert!(starving > 1.0 / 30.0);
        assert!(draining < 1.0 / 30.0);
    }

    #[test]
    fn test_interval_never_exceeds_min_fps_guarantee() {
        let mut c = FrameRateController::new(30, 15);
        // Maximum pressure on every term
        for _ in 0..20 {
            let interval = c.optimal_interval(1.0, 0.0).as_secs_f64();
            assert!(interval <= 1.0 / 15.0 + 1e-9);
        }
    }

    #[test]
    fn test_fps_smoothing_from_intervals() {
        let mut c = FrameRateController::new(30, 15);
        for _ in 0..30 {
            c.record_interval(0.1); // 10 FPS
        }
        for _ in 0..50 {
            c.update_fps(30.0);
        }
        // The smoothed estimate converges towards the interval-derived rate
        assert!((c.current_fps() - 10.0).abs() < 1.0);
    }

    #[test]
    fn test_should_drop_conditions() {
        let mut c = FrameRateController::new(30, 15);

        assert!(c.should_drop(0.95, 0.0)); // buffer nearly full
        assert!(c.should_drop(0.5, 0.3)); // heavy jitter
        assert!(!c.should_drop(0.5, 0.05)); // healthy

        // Collapse the measured FPS below 0.8×min
        for _ in 0..50 {
            c.record_interval(1.0);
            c.update_fps(1.0);
        }
        assert!(c.should_drop(0.5, 0.0));
    }

    #[test]
    fn test_set_targets_validation() {
        let mut c = FrameRateController::new(30, 15);
        assert!(c.set_targets(60, 20).is_ok());
        assert_eq!(c.target_fps, 60);
        assert_eq!(c.min_fps, 20);

        assert!(c.set_targets(0, 5).is_err());
        assert!(c.set_targets(30, 45).is_err());
        // Failed updates leave state untouched
        assert_eq!(c.target_fps, 60);
    }

    #[test]
    fn test_compensation_clamped() {
        let mut c = FrameRateController::new(30, 15);
        for _ in 0..50 {
            c.optimal_interval(5.0, 0.0);
            assert!(c.compensation() <= COMPENSATION_MAX);
            assert!(c.compensation() >= 0.0);
        }
    }
}

use super::SystemState;
use crate::metrics::{stdev, NetworkMetrics};
use std::collections::VecDeque;

const MAX_HISTORY: usize = 200;
const SMOOTHING_WINDOW: usize = 10;
const CONFIDENCE_WINDOW: usize = 20;

/// Hard bounds on the published compensation factor
const COMPENSATION_FLOOR: f64 = 0.3;
const COMPENSATION_CEIL_CRITICAL: f64 = 4.0;
const COMPENSATION_CEIL_NORMAL: f64 = 3.0;

/// Controller outputs published after every tick
#[derive(Debug, Clone, Copy)]
pub struct ControlOutputs {
    pub quality: u8,
    pub compensation: f64,
    pub state: SystemState,
    pub confidence: f64,
}

/// Adaptive quality/pacing controller.
///
/// Ticks once per processed frame: classifies the pipeline into one of four
/// operational states from FPS, buffer occupancy and network health, then
/// steps the JPEG quality setpoint with a state-dependent gain and derives
/// an outbound compensation factor from four pressure multipliers.
#[derive(Debug)]
pub struct AdaptiveController {
    target_fps: f64,
    min_quality: u8,
    max_quality: u8,

    current_quality: u8,
    compensation_factor: f64,
    system_state: SystemState,
    adaptation_confidence: f64,

    performance_history: VecDeque<f64>,
    quality_history: VecDeque<u8>,
    compensation_history: VecDeque<f64>,
}

impl AdaptiveController {
    pub fn new(target_fps: u32, min_quality: u8, max_quality: u8) -> Self {
        let start_quality =
            min_quality.max(((min_quality as u16 + max_quality as u16) / 2 + 5) as u8);
        Self {
            target_fps: target_fps.max(1) as f64,
            min_quality,
            max_quality,
            current_quality: start_quality.min(max_quality),
            compensation_factor: 1.0,
            system_state: SystemState::Optimal,
            adaptation_confidence: 1.0,
            performance_history: VecDeque::with_capacity(MAX_HISTORY),
            quality_history: VecDeque::with_capacity(MAX_HISTORY),
            compensation_history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }

    /// One control tick. `buffer_utilization` is a fraction in [0, 1].
    pub fn adapt(
        &mut self,
        current_fps: f64,
        buffer_utilization: f64,
        metrics: &NetworkMetrics,
    ) -> ControlOutputs {
        push_bounded(&mut self.performance_history, current_fps);
        push_bounded(&mut self.quality_history, self.current_quality);

        self.system_state = self.classify(current_fps, buffer_utilization, metrics.jitter);
        self.step_quality(current_fps);
        self.update_compensation(current_fps, buffer_utilization, metrics);
        self.update_confidence();

        ControlOutputs {
            quality: self.current_quality,
            compensation: self.compensation_factor,
            state: self.system_state,
            confidence: self.adaptation_confidence,
        }
    }

    /// Weighted state classification:
    /// 0.4·fps_ratio + 0.3·buffer_ratio + 0.3·(1 − min(1, 10·jitter)).
    pub fn classify(&self, current_fps: f64, buffer_utilization: f64, jitter: f64) -> SystemState {
        let fps_score = current_fps / self.target_fps;
        let buffer_score = buffer_utilization.clamp(0.0, 1.0);
        let network_score = 1.0 - (jitter * 10.0).min(1.0);

        let combined = fps_score * 0.4 + buffer_score * 0.3 + network_score * 0.3;
        SystemState::from_combined_score(combined)
    }

    fn step_quality(&mut self, current_fps: f64) {
        // Dead zone: within ±5% of target the setpoint is left alone
        if (current_fps - self.target_fps).abs() <= self.target_fps * 0.05 {
            return;
        }

        let quality = self.current_quality as i32;
        let stepped = match self.system_state {
            SystemState::Critical => {
                let step = ((self.target_fps - current_fps) / 3.0) as i32;
                quality - step.max(10)
            }
            SystemState::Degraded => {
                if current_fps < self.target_fps * 0.8 {
                    let step = ((self.target_fps - current_fps) / 4.0) as i32;
                    quality - step.max(5)
                } else if current_fps > self.target_fps * 0.95 {
                    let step = ((current_fps - self.target_fps * 0.8) / 10.0) as i32;
                    quality + step.min(3)
                } else {
                    quality
                }
            }
            SystemState::Recovering => quality,
            SystemState::Optimal => {
                if current_fps > self.target_fps * 0.95 {
                    let step = ((current_fps - self.target_fps * 0.9) / 15.0) as i32;
                    quality + step.min(2)
                } else {
                    quality
                }
            }
        };

        self.current_quality = stepped.clamp(self.min_quality as i32, self.max_quality as i32) as u8;
    }

    fn update_compensation(
        &mut self,
        current_fps: f64,
        buffer_utilization: f64,
        metrics: &NetworkMetrics,
    ) {
        let network_factor = 1.0 + metrics.jitter * 15.0;
        let buffer_factor = 1.0 + (1.0 - buffer_utilization.clamp(0.0, 1.0)) * 0.8;
        let performance_factor = 1.0 + (self.target_fps - current_fps) / self.target_fps;
        let congestion_factor = 1.0 + metrics.congestion_level * 0.5;

        let instantaneous = if self.system_state == SystemState::Critical {
            (network_factor * buffer_factor * performance_factor * 1.5)
                .min(COMPENSATION_CEIL_CRITICAL)
        } else {
            (network_factor * buffer_factor * performance_factor * congestion_factor)
                .min(COMPENSATION_CEIL_NORMAL)
        };

        let smoothed = if self.compensation_history.is_empty() {
            instantaneous
        } else {
            let recent: Vec<f64> = self
                .compensation_history
                .iter()
                .rev()
                .take(SMOOTHING_WINDOW)
                .cloned()
                .collect();
            let mean = recent.iter().sum::<f64>() / recent.len() as f64;
            instantaneous * 0.7 + mean * 0.3
        };

        self.compensation_factor =
            smoothed.clamp(COMPENSATION_FLOOR, COMPENSATION_CEIL_CRITICAL);
        push_bounded(&mut self.compensation_history, self.compensation_factor);
    }

    fn update_confidence(&mut self) {
        if self.performance_history.len() <= CONFIDENCE_WINDOW {
            return;
        }
        let recent: Vec<f64> = self
            .performance_history
            .iter()
            .rev()
            .take(CONFIDENCE_WINDOW)
            .cloned()
            .collect();
        let stability = 1.0 - stdev(&recent) / self.target_fps;
        self.adaptation_confidence = stability.clamp(0.1, 1.0);
    }

    pub fn quality(&self) -> u8 {
        self.current_quality
    }

    pub fn compensation(&self) -> f64 {
        self.compensation_factor
    }

    pub fn state(&self) -> SystemState {
        self.system_state
    }

    pub fn confidence(&self) -> f64 {
        self.adaptation_confidence
    }

    pub fn set_quality_bounds(&mut self, min_quality: u8, max_quality: u8) {
        self.min_quality = min_quality;
        self.max_quality = max_quality;
        self.current_quality = self.current_quality.clamp(min_quality, max_quality);
    }

    pub fn set_target_fps(&mut self, target_fps: u32) {
        self.target_fps = target_fps.max(1) as f64;
    }

    pub fn reset(&mut self) {
        self.performance_history.clear();
        self.quality_history.clear();
        self.compensation_history.clear();
        self.compensation_factor = 1.0;
        self.adaptation_confidence = 1.0;
        self.system_state = SystemState::Optimal;
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, value: T) {
    if history.len() >= MAX_HISTORY {
        history.pop_front();
    }
    history.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_metrics() -> NetworkMetrics {
        NetworkMetrics::new(30)
    }

    fn jittery_metrics() -> NetworkMetrics {
        let mut m = NetworkMetrics::new(30);
        for i in 0..40 {
            let l = if i % 2 == 0 { 0.005 } else { 0.250 };
            m.update(l, 1.0 / 30.0, 20_000);
        }
        m
    }

    #[test]
    fn test_classification_matches_documented_states() {
        let c = AdaptiveController::new(30, 60, 90);

        // Full FPS, full buffer, clean network
        assert_eq!(c.classify(30.0, 1.0, 0.0), SystemState::Optimal);
        // Everything collapsed
        assert_eq!(c.classify(0.0, 0.0, 1.0), SystemState::Critical);
        // Half FPS, modest buffer, clean network:
        // 0.4*0.5 + 0.3*0.5 + 0.3*1.0 = 0.65 -> degraded
        assert_eq!(c.classify(15.0, 0.5, 0.0), SystemState::Degraded);
        // 0.4*1.0 + 0.3*0.5 + 0.3*1.0 = 0.85 -> recovering
        assert_eq!(c.classify(30.0, 0.5, 0.0), SystemState::Recovering);
    }

    #[test]
    fn test_quality_stays_within_bounds() {
        let mut c = AdaptiveController::new(30, 60, 90);
        let metrics = quiet_metrics();

        // Hammer it with a collapsed pipeline; quality must clamp at 60
        for _ in 0..50 {
            let out = c.adapt(2.0, 0.05, &metrics);
            assert!(out.quality >= 60 && out.quality <= 90);
        }
        assert_eq!(c.quality(), 60);

        // Now an overdriven producer; quality climbs but stops at 90
        for _ in 0..200 {
            let out = c.adapt(45.0, 0.9, &metrics);
            assert!(out.quality >= 60 && out.quality <= 90);
        }
        assert_eq!(c.quality(), 90);
    }

    #[test]
    fn test_dead_zone_freezes_quality() {
        let mut c = AdaptiveController::new(30, 60, 90);
        let metrics = quiet_metrics();

        let before = c.quality();
        // 29.0 FPS is within ±5% of a 30 FPS target
        for _ in 0..20 {
            c.adapt(29.0, 0.5, &metrics);
        }
        assert_eq!(c.quality(), before);
    }

    #[test]
    fn test_compensation_bounds() {
        let mut c = AdaptiveController::new(30, 60, 90);

        let jittery = jittery_metrics();
        for _ in 0..50 {
            let out = c.adapt(3.0, 0.05, &jittery);
            assert!(out.compensation >= 0.3 && out.compensation <= 4.0);
        }
        // Starved pipeline with heavy jitter drives compensation well up
        assert!(c.compensation() > 1.5);

        let quiet = quiet_metrics();
        for _ in 0..100 {
            let out = c.adapt(30.0, 0.9, &quiet);
            assert!(out.compensation >= 0.3 && out.compensation <= 4.0);
        }
    }

    #[test]
    fn test_confidence_reflects_fps_stability() {
        let mut c = AdaptiveController::new(30, 60, 90);
        let metrics = quiet_metrics();

        for _ in 0..40 {
            c.adapt(30.0, 0.5, &metrics);
        }
        assert!(c.confidence() > 0.9);

        let mut c = AdaptiveController::new(30, 60, 90);
        for i in 0..40 {
            let fps = if i % 2 == 0 { 2.0 } else { 30.0 };
            c.adapt(fps, 0.5, &metrics);
        }
        assert!(c.confidence() < 0.7);
        assert!(c.confidence() >= 0.1);
    }

    #[test]
    fn test_outputs_always_finite() {
        let mut c = AdaptiveController::new(30, 60, 90);
        let metrics = quiet_metrics();
        for fps in [0.0, 1e9, 30.0] {
            let out = c.adapt(fps, 0.5, &metrics);
            assert!(out.compensation.is_finite());
            assert!(out.confidence.is_finite());
        }
    }

    #[test]
    fn test_reset_restores_neutral_state() {
        let mut c = AdaptiveController::new(30, 60, 90);
        let jittery = jittery_metrics();
        for _ in 0..30 {
            c.adapt(3.0, 0.05, &jittery);
        }
        c.reset();
        assert_eq!(c.state(), SystemState::Optimal);
        assert_eq!(c.compensation(), 1.0);
        assert_eq!(c.confidence(), 1.0);
    }
}

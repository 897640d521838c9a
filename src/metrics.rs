use std::collections::VecDeque;

/// History window sizes
const MAX_HISTORY: usize = 100;
const JITTER_WINDOW: usize = 20;
const LOSS_WINDOW: usize = 20;
const PREDICTION_WINDOW: usize = 10;
const CONGESTION_WINDOW: usize = 10;

/// Minimum samples before derived metrics are computed
const MIN_SAMPLES: usize = 5;

/// Sliding-window network statistics for the ingest path.
///
/// Updated after every admitted frame with (latency, inter-arrival
/// interval, payload size). Derived scalars are recomputed at update time
/// and are always finite; numerical failures fall back to documented
/// defaults instead of publishing NaN or infinity.
#[derive(Debug)]
pub struct NetworkMetrics {
    latency_history: VecDeque<f64>,
    frame_intervals: VecDeque<f64>,
    bandwidth_history: VecDeque<f64>,
    nominal_interval: f64,

    /// Exponentially weighted average latency (seconds)
    pub avg_latency: f64,
    /// Standard deviation of recent latencies (seconds)
    pub jitter: f64,
    /// Interval-deviation proxy for packet loss, in [0, 1]
    pub packet_loss_rate: f64,
    /// One-step-ahead latency prediction (seconds)
    pub predicted_latency: f64,
    /// Recent mean bandwidth over recent peak bandwidth, in [0, 1]
    pub congestion_level: f64,
}

impl NetworkMetrics {
    pub fn new(target_fps: u32) -> Self {
        Self {
            latency_history: VecDeque::with_capacity(MAX_HISTORY),
            frame_intervals: VecDeque::with_capacity(MAX_HISTORY),
            bandwidth_history: VecDeque::with_capacity(MAX_HISTORY),
            nominal_interval: 1.0 / target_fps.max(1) as f64,
            avg_latency: 0.0,
            jitter: 0.0,
            packet_loss_rate: 0.0,
            predicted_latency: 0.0,
            congestion_level: 0.0,
        }
    }

    /// Record one admitted frame and refresh all derived metrics.
    pub fn update(&mut self, latency_secs: f64, interval_secs: f64, frame_size: usize) {
        push_bounded(&mut self.latency_history, sanitize(latency_secs, 0.0));
        push_bounded(&mut self.frame_intervals, sanitize(interval_secs, 0.0));
        if frame_size > 0 && interval_secs > 0.0 {
            push_bounded(
                &mut self.bandwidth_history,
                sanitize(frame_size as f64 / interval_secs, 0.0),
            );
        }

        if self.latency_history.len() <= MIN_SAMPLES {
            return;
        }

        self.avg_latency = sanitize(self.weighted_latency(), self.avg_latency);
        self.jitter = sanitize(self.latency_stdev(JITTER_WINDOW), 0.0);
        self.packet_loss_rate = sanitize(self.interval_deviation(), 0.0).clamp(0.0, 1.0);
        self.predicted_latency = sanitize(self.regress_latency(), self.avg_latency);
        self.congestion_level = sanitize(self.bandwidth_congestion(), 0.0).clamp(0.0, 1.0);
    }

    /// Exponentially weighted moving average over the full latency window,
    /// newer samples weighted heavier.
    fn weighted_latency(&self) -> f64 {
        let mut weight_sum = 0.0;
        let mut weighted = 0.0;
        for (i, &l) in self.latency_history.iter().enumerate() {
            let w = (i as f64 * 0.1).exp();
            weighted += w * l;
            weight_sum += w;
        }
        if weight_sum > 0.0 {
            weighted / weight_sum
        } else {
            0.0
        }
    }

    fn latency_stdev(&self, window: usize) -> f64 {
        let recent: Vec<f64> = tail(&self.latency_history, window);
        stdev(&recent)
    }

    /// Mean relative deviation of measured intervals from the nominal
    /// target interval; a proxy for loss and stalls on the producer link.
    fn interval_deviation(&self) -> f64 {
        let recent: Vec<f64> = tail(&self.frame_intervals, LOSS_WINDOW);
        if recent.is_empty() || self.nominal_interval <= 0.0 {
            return 0.0;
        }
        let mean_dev = recent
            .iter()
            .map(|x| (x - self.nominal_interval).abs())
            .sum::<f64>()
            / recent.len() as f64;
        mean_dev / self.nominal_interval
    }

    /// Least-squares one-step-ahead extrapolation over the last samples;
    /// falls back to the weighted average when the fit degenerates.
    fn regress_latency(&self) -> f64 {
        let recent: Vec<f64> = tail(&self.latency_history, PREDICTION_WINDOW);
        let n = recent.len();
        if n < PREDICTION_WINDOW {
            return self.avg_latency;
        }

        let n_f = n as f64;
        let x_mean = (n_f - 1.0) / 2.0;
        let y_mean = recent.iter().sum::<f64>() / n_f;

        let mut num = 0.0;
        let mut den = 0.0;
        for (i, &y) in recent.iter().enumerate() {
            let dx = i as f64 - x_mean;
            num += dx * (y - y_mean);
            den += dx * dx;
        }

        if den.abs() < f64::EPSILON {
            return self.avg_latency;
        }

        let slope = num / den;
        let intercept = y_mean - slope * x_mean;
        let predicted = slope * (n_f + 1.0) + intercept;
        if predicted.is_finite() {
            predicted
        } else {
            self.avg_latency
        }
    }

    fn bandwidth_congestion(&self) -> f64 {
        let recent: Vec<f64> = tail(&self.bandwidth_history, CONGESTION_WINDOW);
        if recent.len() <= MIN_SAMPLES {
            return 0.0;
        }
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let max = recent.iter().cloned().fold(0.0, f64::max);
        if max > 0.0 {
            mean / max
        } else {
            0.0
        }
    }

    pub fn sample_count(&self) -> usize {
        self.latency_history.len()
    }

    pub fn reset(&mut self) {
        self.latency_history.clear();
        self.frame_intervals.clear();
        self.bandwidth_history.clear();
        self.avg_latency = 0.0;
        self.jitter = 0.0;
        self.packet_loss_rate = 0.0;
        self.predicted_latency = 0.0;
        self.congestion_level = 0.0;
    }
}

fn push_bounded(history: &mut VecDeque<f64>, value: f64) {
    if history.len() >= MAX_HISTORY {
        history.pop_front();
    }
    history.push_back(value);
}

fn tail(history: &VecDeque<f64>, window: usize) -> Vec<f64> {
    let skip = history.len().saturating_sub(window);
    history.iter().skip(skip).cloned().collect()
}

/// Sample standard deviation over a slice; zero for short inputs
pub fn stdev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>()
        / (values.len() - 1) as f64;
    var.sqrt()
}

/// Replace non-finite values with a documented default
pub fn sanitize(value: f64, default: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        default
    }
}

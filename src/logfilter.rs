use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Rate-limited log gate keyed by semantic message key.
///
/// High-frequency paths (control loop, stream pacing, recorder saves) ask
/// the gate before emitting a warning or informational line; repeats of the
/// same key inside the cooldown window are suppressed. Cooldowns: 30 s for
/// warnings, 60 s for informational messages.
pub struct LogGate {
    warn_cooldown: Duration,
    info_cooldown: Duration,
    warn_last: Mutex<HashMap<String, Instant>>,
    info_last: Mutex<HashMap<String, Instant>>,
}

impl LogGate {
    pub fn new() -> Self {
        Self::with_cooldowns(Duration::from_secs(30), Duration::from_secs(60))
    }

    pub fn with_cooldowns(warn_cooldown: Duration, info_cooldown: Duration) -> Self {
        Self {
            warn_cooldown,
            info_cooldown,
            warn_last: Mutex::new(HashMap::new()),
            info_last: Mutex::new(HashMap::new()),
        }
    }

    /// True if a warning with this key may be emitted now
    pub fn allow_warn(&self, key: &str) -> bool {
        Self::allow(&self.warn_last, key, self.warn_cooldown)
    }

    /// True if an informational message with this key may be emitted now
    pub fn allow_info(&self, key: &str) -> bool {
        Self::allow(&self.info_last, key, self.info_cooldown)
    }

    fn allow(map: &Mutex<HashMap<String, Instant>>, key: &str, cooldown: Duration) -> bool {
        let now = Instant::now();
        let mut last = map.lock();

        match last.get(key) {
            Some(at) if now.duration_since(*at) < cooldown => false,
            _ => {
                last.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Drop all remembered keys (used by stats reset)
    pub fn clear(&self) {
        self.warn_last.lock().clear();
        self.info_last.lock().clear();
    }
}

impl Default for LogGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_emit_allowed() {
        let gate = LogGate::new();
        assert!(gate.allow_warn("low_fps"));
        assert!(gate.allow_info("buffering_complete"));
    }

    #[test]
    fn test_repeat_within_cooldown_suppressed() {
        let gate = LogGate::new();
        assert!(gate.allow_warn("low_fps"));
        assert!(!gate.allow_warn("low_fps"));
        // Different key is independent
        assert!(gate.allow_warn("buffer_empty"));
    }

    #[test]
    fn test_repeat_after_cooldown_allowed() {
        let gate = LogGate::with_cooldowns(Duration::from_millis(0), Duration::from_millis(0));
        assert!(gate.allow_warn("low_fps"));
        assert!(gate.allow_warn("low_fps"));
    }

    #[test]
    fn test_warn_and_info_tracked_separately() {
        let gate = LogGate::new();
        assert!(gate.allow_warn("status"));
        assert!(gate.allow_info("status"));
        assert!(!gate.allow_warn("status"));
        assert!(!gate.allow_info("status"));
    }

    #[test]
    fn test_clear_resets_keys() {
        let gate = LogGate::new();
        assert!(gate.allow_warn("status"));
        gate.clear();
        assert!(gate.allow_warn("status"));
    }
}

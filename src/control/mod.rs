pub mod adaptive;
pub mod framerate;

pub use adaptive::{AdaptiveController, ControlOutputs};
pub use framerate::FrameRateController;

use serde::{Deserialize, Serialize};

/// Operational state of the pipeline, re-derived on every controller tick
/// from the weighted combination of FPS, buffer and network scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    Optimal,
    Recovering,
    Degraded,
    Critical,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::Optimal => "optimal",
            SystemState::Recovering => "recovering",
            SystemState::Degraded => "degraded",
            SystemState::Critical => "critical",
        }
    }

    /// Classify a combined score: < 0.5 critical, < 0.8 degraded,
    /// < 0.95 recovering, else optimal.
    pub fn from_combined_score(score: f64) -> Self {
        if score < 0.5 {
            SystemState::Critical
        } else if score < 0.8 {
            SystemState::Degraded
        } else if score < 0.95 {
            SystemState::Recovering
        } else {
            SystemState::Optimal
        }
    }
}

impl std::fmt::Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification_boundaries() {
        assert_eq!(SystemState::from_combined_score(0.0), SystemState::Critical);
        assert_eq!(
            SystemState::from_combined_score(0.499),
            SystemState::Critical
        );
        assert_eq!(SystemState::from_combined_score(0.5), SystemState::Degraded);
        assert_eq!(
            SystemState::from_combined_score(0.799),
            SystemState::Degraded
        );
        assert_eq!(
            SystemState::from_combined_score(0.8),
            SystemState::Recovering
        );
        assert_eq!(
            SystemState::from_combined_score(0.949),
            SystemState::Recovering
        );
        assert_eq!(SystemState::from_combined_score(0.95), SystemState::Optimal);
        assert_eq!(SystemState::from_combined_score(1.5), SystemState::Optimal);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SystemState::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(SystemState::Critical.as_str(), "critical");
    }
}

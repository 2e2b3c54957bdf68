//! Attention signal source.
//!
//! The session takes any `AttentionSource`, so a real camera-based detector
//! can be substituted without touching the pipeline. The placeholder here
//! reports a fixed state; it does not fabricate attention readings.

// Distracted/Away are only produced by real detector implementations.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttentionState {
    Focused,
    Distracted,
    Away,
}

impl AttentionState {
    pub fn label(&self) -> &'static str {
        match self {
            AttentionState::Focused => "focused",
            AttentionState::Distracted => "distracted",
            AttentionState::Away => "away",
        }
    }
}

pub trait AttentionSource: Send {
    fn sample(&mut self) -> AttentionState;
}

/// Placeholder source: reports a fixed state.
pub struct SteadyAttention(pub AttentionState);

impl Default for SteadyAttention {
    fn default() -> Self {
        SteadyAttention(AttentionState::Focused)
    }
}

impl AttentionSource for SteadyAttention {
    fn sample(&mut self) -> AttentionState {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_source_reports_its_fixed_state() {
        let mut source = SteadyAttention(AttentionState::Distracted);
        assert_eq!(source.sample(), AttentionState::Distracted);
        assert_eq!(source.sample(), AttentionState::Distracted);
    }
}

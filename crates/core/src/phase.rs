//! Lifecycle phase of a `PaymentJob`.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Coarse lifecycle state reported in `status.phase`.
///
/// Phases only move forward: `Pending → Running → Succeeded | Failed`.
/// Skipping a phase is allowed (a short Job may go straight from Pending to
/// Succeeded), moving backwards is not.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Phase::Pending => 0,
            Phase::Running => 1,
            Phase::Succeeded | Phase::Failed => 2,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition for the
    /// same Job. Terminal phases accept nothing.
    pub fn can_advance_to(self, next: Phase) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
        }
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

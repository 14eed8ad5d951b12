use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle states for a work unit, in monotonic rank order.
///
/// A unit may only move to a state whose rank is greater than or equal to its
/// current rank, and an end state accepts no further transitions. The two
/// cancellation states carry the highest ranks so cancellation is reachable
/// from any non-terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum UnitStatus {
    Available,
    Negotiating,
    Acquired,
    Running,
    Done,
    Failed,
    CancelRequested,
    Canceled,
}

impl UnitStatus {
    /// All states, indexable by [`Self::rank`].
    pub const ALL: [UnitStatus; 8] = [
        UnitStatus::Available,
        UnitStatus::Negotiating,
        UnitStatus::Acquired,
        UnitStatus::Running,
        UnitStatus::Done,
        UnitStatus::Failed,
        UnitStatus::CancelRequested,
        UnitStatus::Canceled,
    ];

    /// Position in the monotonic ordering.
    pub fn rank(self) -> u8 {
        match self {
            UnitStatus::Available => 0,
            UnitStatus::Negotiating => 1,
            UnitStatus::Acquired => 2,
            UnitStatus::Running => 3,
            UnitStatus::Done => 4,
            UnitStatus::Failed => 5,
            UnitStatus::CancelRequested => 6,
            UnitStatus::Canceled => 7,
        }
    }

    /// True for states from which no further progress is expected.
    pub fn is_end_state(self) -> bool {
        matches!(
            self,
            UnitStatus::Done | UnitStatus::Failed | UnitStatus::Canceled
        )
    }

    /// Whether an update to `next` is admissible from this state.
    ///
    /// End states are final. Everything else accepts any state of equal or
    /// higher rank, which makes out-of-order delivery from a distributed
    /// store safe to drop rather than needing locking.
    pub fn can_transition_to(self, next: UnitStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_end_state() {
            return false;
        }
        next.rank() >= self.rank()
    }

    /// The tracker-side vocabulary for this state, if it has one.
    ///
    /// States without a mapping are internal to the scheduler and are never
    /// pushed to the tracker.
    pub fn tracker_status(self) -> Option<TrackerStatus> {
        match self {
            UnitStatus::Acquired => Some(TrackerStatus::Acquired),
            UnitStatus::Running => Some(TrackerStatus::Running),
            UnitStatus::Failed => Some(TrackerStatus::Failed),
            UnitStatus::Canceled | UnitStatus::CancelRequested => Some(TrackerStatus::Aborted),
            UnitStatus::Done => Some(TrackerStatus::Completed),
            UnitStatus::Available | UnitStatus::Negotiating => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Available => "Available",
            UnitStatus::Negotiating => "Negotiating",
            UnitStatus::Acquired => "Acquired",
            UnitStatus::Running => "Running",
            UnitStatus::Done => "Done",
            UnitStatus::Failed => "Failed",
            UnitStatus::CancelRequested => "CancelRequested",
            UnitStatus::Canceled => "Canceled",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UnitStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ModelError::InvalidStatus(s.to_string()))
    }
}

/// Request status vocabulary used by the external tracker.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackerStatus {
    Acquired,
    Running,
    Failed,
    Aborted,
    Completed,
    Announced,
    ClosedOut,
    Rejected,
}

impl TrackerStatus {
    /// Terminal tracker statuses: once a request reaches one of these the
    /// tracker will not move it again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackerStatus::Failed
                | TrackerStatus::Completed
                | TrackerStatus::Announced
                | TrackerStatus::ClosedOut
                | TrackerStatus::Rejected
                | TrackerStatus::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackerStatus::Acquired => "acquired",
            TrackerStatus::Running => "running",
            TrackerStatus::Failed => "failed",
            TrackerStatus::Aborted => "aborted",
            TrackerStatus::Completed => "completed",
            TrackerStatus::Announced => "announced",
            TrackerStatus::ClosedOut => "closed-out",
            TrackerStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for TrackerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

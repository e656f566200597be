//! Planner state machine.

use std::sync::atomic::{AtomicU8, Ordering};

/// Where the planner is in its update/apply cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PlannerState {
    /// No cycle in progress.
    Idle = 0,
    /// A planning job was launched but has not started.
    QueuedForUpdate = 1,
    /// The planning job is running.
    Updating = 2,
    /// The planning job finished; its output awaits commit.
    QueuedForSync = 3,
    /// A committed schedule awaits apply.
    QueuedForSchedule = 4,
    /// The committed schedule is stale and will be dropped on apply.
    QueuedForScheduleDiscard = 5,
}

impl PlannerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::QueuedForUpdate,
            2 => Self::Updating,
            3 => Self::QueuedForSync,
            4 => Self::QueuedForSchedule,
            5 => Self::QueuedForScheduleDiscard,
            _ => Self::Idle,
        }
    }

    /// Whether a planning job may still be producing output.
    #[must_use]
    pub fn is_planning(self) -> bool {
        matches!(self, Self::QueuedForUpdate | Self::Updating)
    }
}

/// The state shared between the render thread and the planning worker.
///
/// The worker only performs the `QueuedForUpdate -> Updating -> QueuedForSync`
/// transitions; every other transition happens on the render thread under the
/// scheduler lock.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    #[must_use]
    pub fn new(state: PlannerState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    #[must_use]
    pub fn get(&self) -> PlannerState {
        PlannerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: PlannerState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`. Returns `false` if the state was not `from`.
    pub fn transition(&self, from: PlannerState, to: PlannerState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_requires_expected_state() {
        let cell = StateCell::new(PlannerState::QueuedForUpdate);
        assert!(cell.transition(PlannerState::QueuedForUpdate, PlannerState::Updating));
        assert!(!cell.transition(PlannerState::QueuedForUpdate, PlannerState::Updating));
        assert_eq!(cell.get(), PlannerState::Updating);
        assert!(cell.get().is_planning());

        cell.set(PlannerState::QueuedForScheduleDiscard);
        assert_eq!(cell.get(), PlannerState::QueuedForScheduleDiscard);
        assert!(!cell.get().is_planning());
    }
}

//! Review lifecycle state machine
//!
//! The transition table is closed: any (state, event) pair not listed is
//! rejected with `InvalidTransition`, and terminal states accept nothing.
//! [`transition`] is pure; the orchestrator performs the returned
//! [`SideEffect`] and persists the new state.
//!
//! | From                      | Event            | To                | Side effect              |
//! |---------------------------|------------------|-------------------|--------------------------|
//! | new                       | SubmitForReview  | pending_review    | enqueue reviewer spawn   |
//! | pending_review            | StartReview      | under_review      | spawn reviewer           |
//! | pending_review            | Cancel           | cancelled         | abort pending spawn      |
//! | under_review              | Approve          | approved          | persist iteration        |
//! | under_review              | RequestChanges   | changes_requested | persist iteration+issues |
//! | under_review              | Reject           | rejected          | persist iteration        |
//! | under_review              | Cancel           | cancelled         | stop reviewer            |
//! | changes_requested         | Resubmit         | re_review         | none                     |
//! | changes_requested         | Cancel           | cancelled         | none                     |
//! | re_review                 | StartReview      | under_review      | spawn reviewer           |
//! | re_review                 | Cancel           | cancelled         | none                     |

use crate::error::{HermesError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewState {
    New,
    PendingReview,
    UnderReview,
    Approved,
    Rejected,
    ChangesRequested,
    ReReview,
    Cancelled,
}

impl ReviewState {
    pub const ALL: [ReviewState; 8] = [
        ReviewState::New,
        ReviewState::PendingReview,
        ReviewState::UnderReview,
        ReviewState::Approved,
        ReviewState::Rejected,
        ReviewState::ChangesRequested,
        ReviewState::ReReview,
        ReviewState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReviewState::Approved | ReviewState::Rejected | ReviewState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::New => "new",
            ReviewState::PendingReview => "pending_review",
            ReviewState::UnderReview => "under_review",
            ReviewState::Approved => "approved",
            ReviewState::Rejected => "rejected",
            ReviewState::ChangesRequested => "changes_requested",
            ReviewState::ReReview => "re_review",
            ReviewState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }
}

impl std::fmt::Display for ReviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewEvent {
    SubmitForReview,
    StartReview,
    Approve,
    RequestChanges,
    Reject,
    Resubmit,
    Cancel,
}

impl ReviewEvent {
    pub const ALL: [ReviewEvent; 7] = [
        ReviewEvent::SubmitForReview,
        ReviewEvent::StartReview,
        ReviewEvent::Approve,
        ReviewEvent::RequestChanges,
        ReviewEvent::Reject,
        ReviewEvent::Resubmit,
        ReviewEvent::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewEvent::SubmitForReview => "submit_for_review",
            ReviewEvent::StartReview => "start_review",
            ReviewEvent::Approve => "approve",
            ReviewEvent::RequestChanges => "request_changes",
            ReviewEvent::Reject => "reject",
            ReviewEvent::Resubmit => "resubmit",
            ReviewEvent::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for ReviewEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work the orchestrator must do for an accepted transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    None,
    EnqueueReviewerSpawn,
    SpawnReviewer,
    AbortPendingSpawn,
    PersistIteration,
    PersistIterationWithIssues,
    StopReviewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ReviewState,
    pub to: ReviewState,
    pub effect: SideEffect,
}

/// Apply `event` to `from` according to the closed transition table
pub fn transition(from: ReviewState, event: ReviewEvent) -> Result<Transition> {
    use ReviewEvent as E;
    use ReviewState as S;

    let (to, effect) = match (from, event) {
        (S::New, E::SubmitForReview) => (S::PendingReview, SideEffect::EnqueueReviewerSpawn),
        (S::PendingReview, E::StartReview) => (S::UnderReview, SideEffect::SpawnReviewer),
        (S::PendingReview, E::Cancel) => (S::Cancelled, SideEffect::AbortPendingSpawn),
        (S::UnderReview, E::Approve) => (S::Approved, SideEffect::PersistIteration),
        (S::UnderReview, E::RequestChanges) => {
            (S::ChangesRequested, SideEffect::PersistIterationWithIssues)
        }
        (S::UnderReview, E::Reject) => (S::Rejected, SideEffect::PersistIteration),
        (S::UnderReview, E::Cancel) => (S::Cancelled, SideEffect::StopReviewer),
        (S::ChangesRequested, E::Resubmit) => (S::ReReview, SideEffect::None),
        (S::ChangesRequested, E::Cancel) => (S::Cancelled, SideEffect::None),
        (S::ReReview, E::StartReview) => (S::UnderReview, SideEffect::SpawnReviewer),
        (S::ReReview, E::Cancel) => (S::Cancelled, SideEffect::None),
        _ => return Err(HermesError::InvalidTransition { from, event }),
    };

    Ok(Transition { from, to, effect })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TABLE: &[(ReviewState, ReviewEvent, ReviewState)] = &[
        (ReviewState::New, ReviewEvent::SubmitForReview, ReviewState::PendingReview),
        (ReviewState::PendingReview, ReviewEvent::StartReview, ReviewState::UnderReview),
        (ReviewState::PendingReview, ReviewEvent::Cancel, ReviewState::Cancelled),
        (ReviewState::UnderReview, ReviewEvent::Approve, ReviewState::Approved),
        (ReviewState::UnderReview, ReviewEvent::RequestChanges, ReviewState::ChangesRequested),
        (ReviewState::UnderReview, ReviewEvent::Reject, ReviewState::Rejected),
        (ReviewState::UnderReview, ReviewEvent::Cancel, ReviewState::Cancelled),
        (ReviewState::ChangesRequested, ReviewEvent::Resubmit, ReviewState::ReReview),
        (ReviewState::ChangesRequested, ReviewEvent::Cancel, ReviewState::Cancelled),
        (ReviewState::ReReview, ReviewEvent::StartReview, ReviewState::UnderReview),
        (ReviewState::ReReview, ReviewEvent::Cancel, ReviewState::Cancelled),
    ];

    #[test]
    fn test_every_pair_matches_table() {
        for from in ReviewState::ALL {
            for event in ReviewEvent::ALL {
                let expected = TABLE
                    .iter()
                    .find(|(f, e, _)| *f == from && *e == event)
                    .map(|(_, _, to)| *to);

                match (transition(from, event), expected) {
                    (Ok(t), Some(to)) => assert_eq!(t.to, to, "{} + {}", from, event),
                    (Err(HermesError::InvalidTransition { .. }), None) => {}
                    (result, expected) => panic!(
                        "{} + {}: got {:?}, expected {:?}",
                        from, event, result, expected
                    ),
                }
            }
        }
    }

    #[test]
    fn test_side_effects() {
        assert_eq!(
            transition(ReviewState::New, ReviewEvent::SubmitForReview)
                .unwrap()
                .effect,
            SideEffect::EnqueueReviewerSpawn
        );
        assert_eq!(
            transition(ReviewState::UnderReview, ReviewEvent::Cancel)
                .unwrap()
                .effect,
            SideEffect::StopReviewer
        );
        assert_eq!(
            transition(ReviewState::PendingReview, ReviewEvent::Cancel)
                .unwrap()
                .effect,
            SideEffect::AbortPendingSpawn
        );
        assert_eq!(
            transition(ReviewState::UnderReview, ReviewEvent::RequestChanges)
                .unwrap()
                .effect,
            SideEffect::PersistIterationWithIssues
        );
    }

    #[test]
    fn test_resubmit_only_from_changes_requested() {
        for from in ReviewState::ALL {
            let result = transition(from, ReviewEvent::Resubmit);
            assert_eq!(result.is_ok(), from == ReviewState::ChangesRequested);
        }
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in ReviewState::ALL {
            assert_eq!(ReviewState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ReviewState::parse("done"), None);
    }

    fn any_state() -> impl Strategy<Value = ReviewState> {
        prop::sample::select(ReviewState::ALL.to_vec())
    }

    fn any_event() -> impl Strategy<Value = ReviewEvent> {
        prop::sample::select(ReviewEvent::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_terminal_states_reject_everything(state in any_state(), event in any_event()) {
            if state.is_terminal() {
                prop_assert!(transition(state, event).is_err());
            }
        }

        #[test]
        fn prop_event_sequences_never_leave_terminal(
            events in prop::collection::vec(any_event(), 0..32)
        ) {
            let mut state = ReviewState::New;
            for event in events {
                let was_terminal = state.is_terminal();
                if let Ok(t) = transition(state, event) {
                    prop_assert!(!was_terminal);
                    state = t.to;
                }
            }
        }
    }
}

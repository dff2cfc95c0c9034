//! Session phase state machine.

use serde::{Deserialize, Serialize};

/// The business-level phase of a session.
///
/// Phases advance in one direction only:
/// `Lobby → Voting → TopicResults → TopicReveal → QuestionPhase → Ended`.
/// `Ended` is terminal; once reached, polling stops and the push channel
/// is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Participants are joining.
    Lobby,
    /// Participants are voting on topics.
    Voting,
    /// Vote tallies are visible.
    TopicResults,
    /// The winning topic is revealed.
    TopicReveal,
    /// The question round is running.
    QuestionPhase,
    /// The session is over. Terminal.
    Ended,
}

impl SessionPhase {
    /// All phases in forward order.
    pub const ALL: [SessionPhase; 6] = [
        SessionPhase::Lobby,
        SessionPhase::Voting,
        SessionPhase::TopicResults,
        SessionPhase::TopicReveal,
        SessionPhase::QuestionPhase,
        SessionPhase::Ended,
    ];

    /// Returns the position of this phase in the forward order.
    pub fn rank(self) -> u8 {
        match self {
            SessionPhase::Lobby => 0,
            SessionPhase::Voting => 1,
            SessionPhase::TopicResults => 2,
            SessionPhase::TopicReveal => 3,
            SessionPhase::QuestionPhase => 4,
            SessionPhase::Ended => 5,
        }
    }

    /// Returns true if this is the terminal phase.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Ended)
    }

    /// Returns true if `next` is a legal phase to move to from `self`.
    ///
    /// Staying in place is legal; moving backward is not.
    pub fn can_advance_to(self, next: SessionPhase) -> bool {
        next.rank() >= self.rank()
    }

    /// Returns the wire name for this phase.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Lobby => "lobby",
            SessionPhase::Voting => "voting",
            SessionPhase::TopicResults => "topic_results",
            SessionPhase::TopicReveal => "topic_reveal",
            SessionPhase::QuestionPhase => "question_phase",
            SessionPhase::Ended => "ended",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        for pair in SessionPhase::ALL.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
            assert!(pair[0].can_advance_to(pair[1]));
            assert!(!pair[1].can_advance_to(pair[0]));
        }
    }

    #[test]
    fn staying_in_place_is_legal() {
        for phase in SessionPhase::ALL {
            assert!(phase.can_advance_to(phase));
        }
    }

    #[test]
    fn skipping_forward_is_legal() {
        assert!(SessionPhase::Lobby.can_advance_to(SessionPhase::QuestionPhase));
        assert!(SessionPhase::Voting.can_advance_to(SessionPhase::Ended));
    }

    #[test]
    fn only_ended_is_terminal() {
        assert!(SessionPhase::Ended.is_terminal());
        for phase in &SessionPhase::ALL[..5] {
            assert!(!phase.is_terminal());
        }
    }

    #[test]
    fn wire_names_roundtrip() {
        for phase in SessionPhase::ALL {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
            let back: SessionPhase = serde_json::from_str(&json).unwrap();
            assert_eq!(back, phase);
        }
    }
}

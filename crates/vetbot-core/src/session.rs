//! The persisted vetting-session record.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ChannelRef, QuestionId, SessionId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Invited,
    AwaitingQuestions,
    PollOpen,
    Deciding,
    Accepted,
    Rejected,
    Expired,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Accepted
                | SessionState::Rejected
                | SessionState::Expired
                | SessionState::Cancelled
        )
    }

    /// PollOpen or any state reachable from it.
    pub fn is_poll_open_or_later(self) -> bool {
        matches!(
            self,
            SessionState::PollOpen
                | SessionState::Deciding
                | SessionState::Accepted
                | SessionState::Rejected
                | SessionState::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Invited => "invited",
            SessionState::AwaitingQuestions => "awaiting_questions",
            SessionState::PollOpen => "poll_open",
            SessionState::Deciding => "deciding",
            SessionState::Accepted => "accepted",
            SessionState::Rejected => "rejected",
            SessionState::Expired => "expired",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single poll answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Approve,
    Veto,
    /// Counts as a response but neither approves nor vetoes.
    Abstain,
}

impl Vote {
    /// Poll answer ids as posted by [`crate::messaging::types::PollSpec::standard`].
    pub const ANSWERS: [&'static str; 3] = ["yes", "no", "blank"];

    pub fn from_answer(answer: &str) -> Option<Vote> {
        match answer.trim().to_lowercase().as_str() {
            "yes" => Some(Vote::Approve),
            "no" => Some(Vote::Veto),
            "blank" => Some(Vote::Abstain),
            _ => None,
        }
    }

    pub fn as_answer(self) -> &'static str {
        match self {
            Vote::Approve => "yes",
            Vote::Veto => "no",
            Vote::Abstain => "blank",
        }
    }
}

/// Result of the poll. Written once, at the PollOpen -> Deciding step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    Expired,
}

impl Outcome {
    pub fn terminal_state(self) -> SessionState {
        match self {
            Outcome::Accepted => SessionState::Accepted,
            Outcome::Rejected => SessionState::Rejected,
            Outcome::Expired => SessionState::Expired,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.terminal_state().as_str())
    }
}

/// One candidate's journey from invite to a terminal outcome.
///
/// Mutated only through [`crate::machine::VettingMachine::transition`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VettingSession {
    pub session_id: SessionId,
    pub candidate_id: UserId,
    pub state: SessionState,
    pub channel_ref: ChannelRef,
    pub questions_asked: Vec<QuestionId>,
    pub created_at: DateTime<Utc>,
    pub poll_opened_at: Option<DateTime<Utc>>,
    pub poll_deadline: Option<DateTime<Utc>>,
    pub responses: BTreeMap<UserId, Vote>,
    pub outcome: Option<Outcome>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl VettingSession {
    pub fn new(
        session_id: SessionId,
        candidate_id: UserId,
        channel_ref: ChannelRef,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            candidate_id,
            state: SessionState::Invited,
            channel_ref,
            questions_asked: Vec::new(),
            created_at: now,
            poll_opened_at: None,
            poll_deadline: None,
            responses: BTreeMap::new(),
            outcome: None,
            closed_at: None,
        }
    }

    /// A session waiting on its deadline.
    pub fn pending_deadline(&self) -> Option<DateTime<Utc>> {
        if self.state == SessionState::PollOpen {
            self.poll_deadline
        } else {
            None
        }
    }

    /// Check the record-level invariants. Returns a description of the first violation.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let reached_poll = self.poll_opened_at.is_some();
        if reached_poll != self.poll_deadline.is_some() {
            return Err("poll_opened_at and poll_deadline must be set together".to_string());
        }
        if self.state.is_poll_open_or_later() && !reached_poll {
            return Err(format!("state {} requires a poll deadline", self.state));
        }
        if !self.state.is_poll_open_or_later() && self.state != SessionState::Cancelled && reached_poll
        {
            return Err(format!("state {} must not carry a poll deadline", self.state));
        }
        match (self.state, self.outcome) {
            (SessionState::Accepted, Some(Outcome::Accepted))
            | (SessionState::Rejected, Some(Outcome::Rejected))
            | (SessionState::Expired, Some(Outcome::Expired))
            | (SessionState::Deciding, Some(_)) => {}
            (SessionState::Cancelled, _) => {}
            (state, Some(o)) => return Err(format!("state {state} must not carry outcome {o}")),
            (state, None) if state.is_terminal() || state == SessionState::Deciding => {
                return Err(format!("state {state} requires an outcome"));
            }
            _ => {}
        }
        if !reached_poll && !self.responses.is_empty() {
            return Err("responses recorded before the poll opened".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_answers_map_both_ways() {
        for answer in Vote::ANSWERS {
            let vote = Vote::from_answer(answer).unwrap();
            assert_eq!(vote.as_answer(), answer);
        }
        assert_eq!(Vote::from_answer(" YES "), Some(Vote::Approve));
        assert_eq!(Vote::from_answer("maybe"), None);
    }

    #[test]
    fn fresh_session_satisfies_invariants() {
        let s = VettingSession::new(
            SessionId("vetting:@a:x".to_string()),
            UserId("@a:x".to_string()),
            ChannelRef("!r:x".to_string()),
            Utc::now(),
        );
        assert_eq!(s.state, SessionState::Invited);
        assert!(s.check_invariants().is_ok());
        assert_eq!(s.pending_deadline(), None);
    }

    #[test]
    fn terminal_without_outcome_is_rejected_by_invariants() {
        let now = Utc::now();
        let mut s = VettingSession::new(
            SessionId("vetting:@a:x".to_string()),
            UserId("@a:x".to_string()),
            ChannelRef("!r:x".to_string()),
            now,
        );
        s.state = SessionState::Accepted;
        s.poll_opened_at = Some(now);
        s.poll_deadline = Some(now);
        assert!(s.check_invariants().is_err());
        s.outcome = Some(Outcome::Accepted);
        assert!(s.check_invariants().is_ok());
    }
}

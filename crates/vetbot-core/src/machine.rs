//! The vetting state machine.
//!
//! `(current session, event) -> (next session, intents)`. The machine is:
//! - **Synchronous**: no async, no I/O
//! - **Deterministic**: the clock is an argument
//! - **Total**: every (state, event) pair not in the table is an
//!   `IllegalTransition` and leaves the session untouched
//!
//! The caller persists the next session and then executes the intents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    decision::{evaluate, tally, DecisionPolicy, Tally},
    domain::{ChannelRef, QuestionId, SessionId, UserId},
    errors::Error,
    session::{Outcome, SessionState, VettingSession, Vote},
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeratorCommandKind {
    Cancel,
}

/// Canonical input of the machine, produced by the normalizer or the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VettingEvent {
    CandidateInvited {
        candidate: UserId,
        channel: ChannelRef,
    },
    QuestionAsked {
        question: QuestionId,
        asked_by: UserId,
    },
    CandidateDoneWithQuestions,
    PollResponseReceived {
        voter: UserId,
        value: Vote,
    },
    TimerFired {
        session_id: SessionId,
    },
    ModeratorCommand {
        kind: ModeratorCommandKind,
    },
}

impl VettingEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            VettingEvent::CandidateInvited { .. } => "candidate_invited",
            VettingEvent::QuestionAsked { .. } => "question_asked",
            VettingEvent::CandidateDoneWithQuestions => "candidate_done_with_questions",
            VettingEvent::PollResponseReceived { .. } => "poll_response_received",
            VettingEvent::TimerFired { .. } => "timer_fired",
            VettingEvent::ModeratorCommand { .. } => "moderator_command",
        }
    }
}

/// Outbound actions the machine wants performed.
///
/// Deadline intents go to the scheduler; everything else to the gateway.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Intent {
    InviteToChannel {
        channel: ChannelRef,
        user: UserId,
    },
    OpenPoll {
        session: SessionId,
        candidate: UserId,
        deadline: DateTime<Utc>,
    },
    ScheduleDeadline {
        session: SessionId,
        fires_at: DateTime<Utc>,
    },
    CancelDeadline {
        session: SessionId,
    },
    ClosePoll {
        session: SessionId,
    },
    AnnounceDecision {
        session: SessionId,
        candidate: UserId,
        outcome: Outcome,
        tally: Tally,
    },
    InviteToMainSpace {
        user: UserId,
    },
    SendWelcome {
        channel: ChannelRef,
        user: UserId,
    },
    NotifyRefusal {
        channel: ChannelRef,
        candidate: UserId,
        outcome: Outcome,
    },
    NotifyCancellation {
        channel: ChannelRef,
        candidate: UserId,
    },
}

impl Intent {
    pub fn kind(&self) -> &'static str {
        match self {
            Intent::InviteToChannel { .. } => "invite_to_channel",
            Intent::OpenPoll { .. } => "open_poll",
            Intent::ScheduleDeadline { .. } => "schedule_deadline",
            Intent::CancelDeadline { .. } => "cancel_deadline",
            Intent::ClosePoll { .. } => "close_poll",
            Intent::AnnounceDecision { .. } => "announce_decision",
            Intent::InviteToMainSpace { .. } => "invite_to_main_space",
            Intent::SendWelcome { .. } => "send_welcome",
            Intent::NotifyRefusal { .. } => "notify_refusal",
            Intent::NotifyCancellation { .. } => "notify_cancellation",
        }
    }
}

/// Result of a legal transition.
#[derive(Clone, Debug, PartialEq)]
pub struct Transition {
    /// State before the event; `None` when the event created the session.
    pub from: Option<SessionState>,
    pub session: VettingSession,
    pub intents: Vec<Intent>,
}

#[derive(Clone, Debug)]
pub struct VettingMachine {
    policy: DecisionPolicy,
    poll_window: Duration,
}

impl VettingMachine {
    pub fn new(policy: DecisionPolicy, poll_window: std::time::Duration) -> Self {
        // Config validation bounds the window; this only guards hand-built machines.
        let poll_window = Duration::from_std(poll_window).unwrap_or_else(|_| Duration::days(3650));
        Self {
            policy,
            poll_window,
        }
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn transition(
        &self,
        session_id: &SessionId,
        current: Option<&VettingSession>,
        event: &VettingEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let Some(current) = current else {
            return self.create(session_id, event, now);
        };

        let reject = || illegal(session_id, Some(current.state), event);
        let mut next = current.clone();
        let mut intents = Vec::new();

        match (current.state, event) {
            (
                SessionState::Invited | SessionState::AwaitingQuestions,
                VettingEvent::QuestionAsked { question, .. },
            ) => {
                // Replays of the same question are duplicates, not new questions.
                if current.questions_asked.contains(question) {
                    return Err(reject());
                }
                next.questions_asked.push(question.clone());
                next.state = SessionState::AwaitingQuestions;
            }

            (SessionState::AwaitingQuestions, VettingEvent::CandidateDoneWithQuestions) => {
                let deadline = now + self.poll_window;
                next.state = SessionState::PollOpen;
                next.poll_opened_at = Some(now);
                next.poll_deadline = Some(deadline);
                intents.push(Intent::OpenPoll {
                    session: session_id.clone(),
                    candidate: current.candidate_id.clone(),
                    deadline,
                });
                intents.push(Intent::ScheduleDeadline {
                    session: session_id.clone(),
                    fires_at: deadline,
                });
            }

            (SessionState::PollOpen, VettingEvent::PollResponseReceived { voter, value }) => {
                if *voter == current.candidate_id {
                    return Err(reject());
                }
                next.responses.insert(voter.clone(), *value);
            }

            (SessionState::PollOpen, VettingEvent::TimerFired { session_id: fired }) => {
                if fired != session_id {
                    return Err(reject());
                }
                self.decide(&mut next, &mut intents, now);
            }

            (
                state,
                VettingEvent::ModeratorCommand {
                    kind: ModeratorCommandKind::Cancel,
                },
            ) if !state.is_terminal() => {
                if state == SessionState::PollOpen {
                    intents.push(Intent::CancelDeadline {
                        session: session_id.clone(),
                    });
                    intents.push(Intent::ClosePoll {
                        session: session_id.clone(),
                    });
                }
                next.state = SessionState::Cancelled;
                next.closed_at = Some(now);
                intents.push(Intent::NotifyCancellation {
                    channel: current.channel_ref.clone(),
                    candidate: current.candidate_id.clone(),
                });
            }

            _ => return Err(reject()),
        }

        Ok(Transition {
            from: Some(current.state),
            session: next,
            intents,
        })
    }

    fn create(
        &self,
        session_id: &SessionId,
        event: &VettingEvent,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let VettingEvent::CandidateInvited { candidate, channel } = event else {
            return Err(illegal(session_id, None, event));
        };

        let session = VettingSession::new(
            session_id.clone(),
            candidate.clone(),
            channel.clone(),
            now,
        );
        Ok(Transition {
            from: None,
            session,
            intents: vec![Intent::InviteToChannel {
                channel: channel.clone(),
                user: candidate.clone(),
            }],
        })
    }

    /// PollOpen -> Deciding -> terminal, in one step. The outcome is written
    /// exactly here and nowhere else.
    fn decide(&self, next: &mut VettingSession, intents: &mut Vec<Intent>, now: DateTime<Utc>) {
        next.state = SessionState::Deciding;
        let outcome = evaluate(&next.responses, &self.policy);
        next.outcome = Some(outcome);

        let session = next.session_id.clone();
        let candidate = next.candidate_id.clone();
        intents.push(Intent::ClosePoll {
            session: session.clone(),
        });
        intents.push(Intent::AnnounceDecision {
            session,
            candidate: candidate.clone(),
            outcome,
            tally: tally(&next.responses),
        });

        match outcome {
            Outcome::Accepted => {
                intents.push(Intent::InviteToMainSpace {
                    user: candidate.clone(),
                });
                intents.push(Intent::SendWelcome {
                    channel: next.channel_ref.clone(),
                    user: candidate,
                });
            }
            Outcome::Rejected | Outcome::Expired => {
                intents.push(Intent::NotifyRefusal {
                    channel: next.channel_ref.clone(),
                    candidate,
                    outcome,
                });
            }
        }

        next.state = outcome.terminal_state();
        next.closed_at = Some(now);
    }
}

fn illegal(session_id: &SessionId, state: Option<SessionState>, event: &VettingEvent) -> Error {
    Error::IllegalTransition {
        session: session_id.clone(),
        state: state.map(|s| s.as_str()).unwrap_or("none").to_string(),
        event: event.kind().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(quorum: u32) -> VettingMachine {
        VettingMachine::new(
            DecisionPolicy {
                quorum,
                max_vetoes: 0,
            },
            std::time::Duration::from_secs(36 * 3600),
        )
    }

    fn candidate() -> UserId {
        UserId("@cand:example.org".to_string())
    }

    fn sid() -> SessionId {
        SessionId::for_candidate(&candidate())
    }

    fn invited() -> VettingEvent {
        VettingEvent::CandidateInvited {
            candidate: candidate(),
            channel: ChannelRef("!vet:example.org".to_string()),
        }
    }

    fn question(id: &str) -> VettingEvent {
        VettingEvent::QuestionAsked {
            question: QuestionId(id.to_string()),
            asked_by: UserId("@mod:example.org".to_string()),
        }
    }

    fn vote(voter: &str, value: Vote) -> VettingEvent {
        VettingEvent::PollResponseReceived {
            voter: UserId(voter.to_string()),
            value,
        }
    }

    fn timer() -> VettingEvent {
        VettingEvent::TimerFired { session_id: sid() }
    }

    fn cancel() -> VettingEvent {
        VettingEvent::ModeratorCommand {
            kind: ModeratorCommandKind::Cancel,
        }
    }

    /// Apply events in order, ignoring illegal ones, collecting every intent.
    fn run(m: &VettingMachine, events: &[VettingEvent]) -> (Option<VettingSession>, Vec<Intent>) {
        let now = Utc::now();
        let mut session: Option<VettingSession> = None;
        let mut all = Vec::new();
        for ev in events {
            if let Ok(t) = m.transition(&sid(), session.as_ref(), ev, now) {
                t.session.check_invariants().unwrap();
                all.extend(t.intents);
                session = Some(t.session);
            }
        }
        (session, all)
    }

    fn all_events() -> Vec<VettingEvent> {
        vec![
            invited(),
            question("q1"),
            VettingEvent::CandidateDoneWithQuestions,
            vote("@a:x", Vote::Approve),
            vote("@b:x", Vote::Veto),
            timer(),
            cancel(),
        ]
    }

    #[test]
    fn end_to_end_accepts_with_single_main_space_invite() {
        let m = machine(2);
        let (session, intents) = run(
            &m,
            &[
                invited(),
                question("q1"),
                question("q2"),
                VettingEvent::CandidateDoneWithQuestions,
                vote("@a:x", Vote::Approve),
                vote("@b:x", Vote::Approve),
                timer(),
            ],
        );
        let session = session.unwrap();
        assert_eq!(session.state, SessionState::Accepted);
        assert_eq!(session.outcome, Some(Outcome::Accepted));
        assert_eq!(session.questions_asked.len(), 2);
        let invites = intents
            .iter()
            .filter(|i| matches!(i, Intent::InviteToMainSpace { .. }))
            .count();
        assert_eq!(invites, 1);
        assert!(intents
            .iter()
            .any(|i| matches!(i, Intent::SendWelcome { .. })));
    }

    #[test]
    fn first_event_must_be_an_invite() {
        let m = machine(2);
        let now = Utc::now();
        for ev in all_events().into_iter().skip(1) {
            let err = m.transition(&sid(), None, &ev, now).unwrap_err();
            assert!(matches!(err, Error::IllegalTransition { .. }), "{ev:?}");
        }
        let t = m.transition(&sid(), None, &invited(), now).unwrap();
        assert_eq!(t.from, None);
        assert_eq!(t.session.state, SessionState::Invited);
        assert_eq!(
            t.intents,
            vec![Intent::InviteToChannel {
                channel: ChannelRef("!vet:example.org".to_string()),
                user: candidate(),
            }]
        );
    }

    /// Event prefixes reaching every reachable state: invited, awaiting
    /// questions, poll open, decided, cancelled.
    fn state_prefixes() -> Vec<Vec<VettingEvent>> {
        vec![
            vec![invited()],
            vec![invited(), question("q1")],
            vec![
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
            ],
            vec![
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
                vote("@a:x", Vote::Approve),
                timer(),
            ],
            vec![invited(), cancel()],
        ]
    }

    #[test]
    fn transition_table_is_total() {
        let m = machine(1);
        let now = Utc::now();
        for prefix in state_prefixes() {
            let (session, _) = run(&m, &prefix);
            let session = session.unwrap();
            for ev in all_events() {
                match m.transition(&sid(), Some(&session), &ev, now) {
                    Ok(t) => t.session.check_invariants().unwrap(),
                    Err(Error::IllegalTransition { .. }) => {}
                    Err(other) => panic!("unexpected error {other}"),
                }
            }
        }
    }

    #[test]
    fn replaying_an_event_is_idempotent() {
        let m = machine(1);
        let now = Utc::now();
        for prefix in state_prefixes() {
            let (session, _) = run(&m, &prefix);
            let session = session.unwrap();
            for ev in all_events() {
                let start = session.clone();
                let once = m
                    .transition(&sid(), Some(&start), &ev, now)
                    .map(|t| t.session)
                    .unwrap_or(start);
                let twice = m
                    .transition(&sid(), Some(&once), &ev, now)
                    .map(|t| t.session)
                    .unwrap_or_else(|_| once.clone());
                assert_eq!(once, twice, "{:?} then {ev:?}", session.state);
            }
        }
    }

    #[test]
    fn duplicate_question_is_not_recorded_twice() {
        let m = machine(2);
        let (session, _) = run(&m, &[invited(), question("q1"), question("q1"), question("q2")]);
        let session = session.unwrap();
        assert_eq!(
            session.questions_asked,
            vec![QuestionId("q1".to_string()), QuestionId("q2".to_string())]
        );
    }

    #[test]
    fn later_vote_overwrites_earlier_vote() {
        let m = machine(2);
        let (session, _) = run(
            &m,
            &[
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
                vote("@a:x", Vote::Approve),
                vote("@a:x", Vote::Veto),
            ],
        );
        let session = session.unwrap();
        assert_eq!(session.responses.len(), 1);
        assert_eq!(
            session.responses.get(&UserId("@a:x".to_string())),
            Some(&Vote::Veto)
        );
    }

    #[test]
    fn candidate_cannot_vote_on_own_poll() {
        let m = machine(1);
        let (session, _) = run(
            &m,
            &[
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
            ],
        );
        let err = m
            .transition(
                &sid(),
                session.as_ref(),
                &vote("@cand:example.org", Vote::Approve),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[test]
    fn votes_before_poll_are_illegal() {
        let m = machine(1);
        let (session, _) = run(&m, &[invited(), question("q1")]);
        let err = m
            .transition(&sid(), session.as_ref(), &vote("@a:x", Vote::Approve), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::IllegalTransition { .. }));
    }

    #[test]
    fn opening_poll_sets_deadline_and_schedules_it() {
        let m = machine(2);
        let now = Utc::now();
        let (session, _) = run(&m, &[invited(), question("q1")]);
        let t = m
            .transition(
                &sid(),
                session.as_ref(),
                &VettingEvent::CandidateDoneWithQuestions,
                now,
            )
            .unwrap();
        let deadline = now + Duration::hours(36);
        assert_eq!(t.session.poll_deadline, Some(deadline));
        assert_eq!(t.session.poll_opened_at, Some(now));
        assert!(t.intents.contains(&Intent::ScheduleDeadline {
            session: sid(),
            fires_at: deadline,
        }));
    }

    #[test]
    fn empty_poll_expires_and_notifies_refusal() {
        let m = machine(2);
        let (session, intents) = run(
            &m,
            &[
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
                timer(),
            ],
        );
        assert_eq!(session.unwrap().state, SessionState::Expired);
        assert!(intents.iter().any(|i| matches!(
            i,
            Intent::NotifyRefusal {
                outcome: Outcome::Expired,
                ..
            }
        )));
        assert!(!intents
            .iter()
            .any(|i| matches!(i, Intent::InviteToMainSpace { .. })));
    }

    #[test]
    fn veto_rejects_even_with_quorum() {
        let m = machine(2);
        let (session, intents) = run(
            &m,
            &[
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
                vote("@a:x", Vote::Veto),
                vote("@b:x", Vote::Approve),
                vote("@c:x", Vote::Approve),
                timer(),
            ],
        );
        assert_eq!(session.unwrap().state, SessionState::Rejected);
        let announced = intents.iter().find_map(|i| match i {
            Intent::AnnounceDecision { tally, .. } => Some(*tally),
            _ => None,
        });
        assert_eq!(
            announced,
            Some(Tally {
                approve: 2,
                veto: 1,
                abstain: 0
            })
        );
    }

    #[test]
    fn timer_for_another_session_is_illegal() {
        let m = machine(1);
        let (session, _) = run(
            &m,
            &[
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
            ],
        );
        let other = VettingEvent::TimerFired {
            session_id: SessionId("vetting:@other:x".to_string()),
        };
        assert!(m
            .transition(&sid(), session.as_ref(), &other, Utc::now())
            .is_err());
    }

    #[test]
    fn cancel_during_poll_closes_poll_and_deadline() {
        let m = machine(1);
        let (session, intents) = run(
            &m,
            &[
                invited(),
                question("q1"),
                VettingEvent::CandidateDoneWithQuestions,
                vote("@a:x", Vote::Approve),
                cancel(),
                timer(),
            ],
        );
        let session = session.unwrap();
        assert_eq!(session.state, SessionState::Cancelled);
        assert_eq!(session.outcome, None);
        assert!(intents.contains(&Intent::CancelDeadline { session: sid() }));
        assert!(intents.contains(&Intent::ClosePoll { session: sid() }));
        assert!(!intents
            .iter()
            .any(|i| matches!(i, Intent::AnnounceDecision { .. })));
    }

    #[test]
    fn terminal_states_reject_everything() {
        let m = machine(1);
        let (session, _) = run(&m, &[invited(), cancel()]);
        let session = session.unwrap();
        assert!(session.state.is_terminal());
        for ev in all_events() {
            assert!(m
                .transition(&sid(), Some(&session), &ev, Utc::now())
                .is_err());
        }
    }
}

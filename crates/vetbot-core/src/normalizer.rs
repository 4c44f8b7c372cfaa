//! Raw gateway traffic -> canonical [`VettingEvent`]s.
//!
//! Two steps. [`route`] decides where a raw event goes without touching the
//! store; the caller resolves the session (by poll key or channel lookup) and
//! then [`normalize`] maps the event against that session. Anything irrelevant
//! to vetting is dropped with a debug log, never an error.

use tracing::debug;

use crate::{
    commands::{parse_command, Command},
    config::Config,
    domain::{ChannelRef, QuestionId, SessionId, UserId},
    machine::VettingEvent,
    messaging::types::{RawEvent, TextMessage},
    session::{VettingSession, Vote},
};

/// Where a raw event should be delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    /// A moderator command in the moderation channel.
    Command {
        sender: UserId,
        command: Command,
    },
    /// A poll response, keyed by the session that opened the poll.
    Session(SessionId),
    /// A message in some other channel; possibly a vetting channel.
    Channel(ChannelRef),
    Drop(&'static str),
}

pub fn route(raw: &RawEvent, cfg: &Config) -> Route {
    match raw {
        RawEvent::Message(msg) => route_message(msg, cfg),
        RawEvent::PollResponse(resp) => {
            if resp.channel != cfg.moderation_channel {
                return Route::Drop("poll response outside the moderation channel");
            }
            if resp.sender == cfg.bot_user_id {
                return Route::Drop("own poll response");
            }
            Route::Session(resp.poll.clone())
        }
        RawEvent::Membership(_) => Route::Drop("membership change"),
    }
}

fn route_message(msg: &TextMessage, cfg: &Config) -> Route {
    if msg.sender == cfg.bot_user_id {
        return Route::Drop("own message");
    }
    if msg.channel != cfg.moderation_channel {
        return Route::Channel(msg.channel.clone());
    }

    let Some(command) = parse_command(&msg.body, &cfg.command_prefix) else {
        return Route::Drop("chatter in the moderation channel");
    };
    if !cfg.is_moderator(&msg.sender) {
        return Route::Drop("command from a non-moderator");
    }
    Route::Command {
        sender: msg.sender.clone(),
        command,
    }
}

/// Map a raw event to the canonical event for `session`.
///
/// `None` for traffic that means nothing to the session (logged at debug).
pub fn normalize(raw: &RawEvent, session: &VettingSession, cfg: &Config) -> Option<VettingEvent> {
    let event = match raw {
        RawEvent::Message(msg) => normalize_message(msg, session, cfg),
        RawEvent::PollResponse(resp) => match Vote::from_answer(&resp.answer) {
            Some(value) => Some(VettingEvent::PollResponseReceived {
                voter: resp.sender.clone(),
                value,
            }),
            None => {
                debug!(session = %session.session_id, answer = %resp.answer, "unknown poll answer dropped");
                return None;
            }
        },
        RawEvent::Membership(_) => None,
    };

    if event.is_none() {
        debug!(session = %session.session_id, "raw event not relevant to vetting, dropped");
    }
    event
}

fn normalize_message(
    msg: &TextMessage,
    session: &VettingSession,
    cfg: &Config,
) -> Option<VettingEvent> {
    if msg.sender == cfg.bot_user_id || msg.channel != session.channel_ref {
        return None;
    }

    let from_candidate = msg.sender == session.candidate_id;
    match parse_command(&msg.body, &cfg.command_prefix) {
        Some(Command::Done) if from_candidate => Some(VettingEvent::CandidateDoneWithQuestions),
        Some(_) => None,
        None if !from_candidate && msg.body.contains('?') => Some(VettingEvent::QuestionAsked {
            question: QuestionId(msg.event_id.clone()),
            asked_by: msg.sender.clone(),
        }),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::types::{Membership, MembershipChange, PollResponse};
    use chrono::Utc;

    fn cfg() -> Config {
        let mut cfg = Config::new(
            UserId("@vetbot:x".to_string()),
            ChannelRef("!mods:x".to_string()),
            ChannelRef("!main:x".to_string()),
        );
        cfg.moderators = vec![UserId("@mod:x".to_string())];
        cfg
    }

    fn session() -> VettingSession {
        let candidate = UserId("@cand:x".to_string());
        VettingSession::new(
            SessionId::for_candidate(&candidate),
            candidate,
            ChannelRef("!vet:x".to_string()),
            Utc::now(),
        )
    }

    fn msg(channel: &str, sender: &str, body: &str) -> RawEvent {
        RawEvent::Message(TextMessage {
            channel: ChannelRef(channel.to_string()),
            sender: UserId(sender.to_string()),
            event_id: "$ev1".to_string(),
            body: body.to_string(),
        })
    }

    fn poll(sender: &str, answer: &str) -> RawEvent {
        RawEvent::PollResponse(PollResponse {
            channel: ChannelRef("!mods:x".to_string()),
            sender: UserId(sender.to_string()),
            poll: SessionId("vetting:@cand:x".to_string()),
            answer: answer.to_string(),
        })
    }

    #[test]
    fn routes_moderator_commands() {
        let route = route(&msg("!mods:x", "@mod:x", "!c start @cand:x"), &cfg());
        assert_eq!(
            route,
            Route::Command {
                sender: UserId("@mod:x".to_string()),
                command: Command::Start(UserId("@cand:x".to_string())),
            }
        );
    }

    #[test]
    fn drops_commands_from_others_and_own_messages() {
        let cfg = cfg();
        assert!(matches!(
            route(&msg("!mods:x", "@rando:x", "!c start @cand:x"), &cfg),
            Route::Drop(_)
        ));
        assert!(matches!(
            route(&msg("!vet:x", "@vetbot:x", "hello?"), &cfg),
            Route::Drop(_)
        ));
        assert!(matches!(
            route(&msg("!mods:x", "@mod:x", "lunch?"), &cfg),
            Route::Drop(_)
        ));
    }

    #[test]
    fn routes_poll_responses_by_key_and_other_messages_by_channel() {
        let cfg = cfg();
        assert_eq!(
            route(&poll("@mod:x", "yes"), &cfg),
            Route::Session(SessionId("vetting:@cand:x".to_string()))
        );
        assert_eq!(
            route(&msg("!vet:x", "@mod:x", "why here?"), &cfg),
            Route::Channel(ChannelRef("!vet:x".to_string()))
        );
        let membership = RawEvent::Membership(MembershipChange {
            channel: ChannelRef("!vet:x".to_string()),
            user: UserId("@cand:x".to_string()),
            membership: Membership::Joined,
        });
        assert!(matches!(route(&membership, &cfg), Route::Drop(_)));
    }

    #[test]
    fn member_question_becomes_question_asked() {
        let ev = normalize(&msg("!vet:x", "@mod:x", "What brings you here?"), &session(), &cfg());
        assert_eq!(
            ev,
            Some(VettingEvent::QuestionAsked {
                question: QuestionId("$ev1".to_string()),
                asked_by: UserId("@mod:x".to_string()),
            })
        );
    }

    #[test]
    fn candidate_done_and_candidate_chatter() {
        let (s, cfg) = (session(), cfg());
        assert_eq!(
            normalize(&msg("!vet:x", "@cand:x", "!c done"), &s, &cfg),
            Some(VettingEvent::CandidateDoneWithQuestions)
        );
        assert_eq!(normalize(&msg("!vet:x", "@cand:x", "is that ok?"), &s, &cfg), None);
        assert_eq!(normalize(&msg("!vet:x", "@mod:x", "!c done"), &s, &cfg), None);
        assert_eq!(normalize(&msg("!vet:x", "@mod:x", "welcome"), &s, &cfg), None);
    }

    #[test]
    fn poll_answers_map_to_votes() {
        let (s, cfg) = (session(), cfg());
        assert_eq!(
            normalize(&poll("@mod:x", "no"), &s, &cfg),
            Some(VettingEvent::PollResponseReceived {
                voter: UserId("@mod:x".to_string()),
                value: Vote::Veto,
            })
        );
        assert_eq!(normalize(&poll("@mod:x", "maybe"), &s, &cfg), None);
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelRef, DeliveryId, SessionId, UserId},
    session::Vote,
};

/// Raw inbound gateway event.
///
/// Network-specific fields should stay in the adapter; this is the shape every
/// adapter reduces its traffic to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawEvent {
    Message(TextMessage),
    PollResponse(PollResponse),
    Membership(MembershipChange),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub channel: ChannelRef,
    pub sender: UserId,
    pub event_id: String,
    pub body: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponse {
    pub channel: ChannelRef,
    pub sender: UserId,
    /// Key the poll was opened with (see [`PollSpec::key`]).
    pub poll: SessionId,
    pub answer: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Membership {
    Invited,
    Joined,
    Left,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipChange {
    pub channel: ChannelRef,
    pub user: UserId,
    pub membership: Membership,
}

/// An inbound event plus the id used to acknowledge it.
///
/// Delivery is at-least-once: an unacknowledged delivery comes back later.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub event: RawEvent,
}

/// Request for a vetting channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub session: SessionId,
    pub candidate: UserId,
    pub name: String,
    /// Members to invite besides the candidate: the moderator allowlist, or the
    /// moderation channel's members when no allowlist is configured.
    pub invitees: Vec<UserId>,
}

/// A single-choice poll posted by the bot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    /// Echoed back on every [`PollResponse`].
    pub key: SessionId,
    pub question: String,
    pub answers: Vec<PollAnswer>,
    pub closes_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollAnswer {
    pub id: String,
    pub label: String,
}

impl PollSpec {
    /// The yes / no / blank poll used for every candidate.
    pub fn standard(key: SessionId, candidate: &UserId, closes_at: DateTime<Utc>) -> Self {
        let answers = [Vote::Approve, Vote::Veto, Vote::Abstain]
            .into_iter()
            .map(|v| {
                let id = v.as_answer();
                let mut label = id.to_string();
                if let Some(first) = label.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }
                PollAnswer {
                    id: id.to_string(),
                    label,
                }
            })
            .collect();
        Self {
            key,
            question: format!("Accept {candidate} into the community?"),
            answers,
            closes_at,
        }
    }
}

/// Capabilities / feature flags of a gateway implementation.
#[derive(Clone, Copy, Debug)]
pub struct GatewayCapabilities {
    pub supports_channel_creation: bool,
    pub max_message_len: usize,
}

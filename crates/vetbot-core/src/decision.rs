//! Poll outcome evaluation.
//!
//! Pure and deterministic: the same response set under the same policy always
//! yields the same outcome.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    domain::UserId,
    session::{Outcome, Vote},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecisionPolicy {
    /// Minimum approval votes required to accept.
    pub quorum: u32,
    /// Veto votes tolerated before the candidate is rejected. `0` means any veto rejects.
    pub max_vetoes: u32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            quorum: 2,
            max_vetoes: 0,
        }
    }
}

/// Vote counts per answer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approve: u32,
    pub veto: u32,
    pub abstain: u32,
}

impl Tally {
    pub fn total(&self) -> u32 {
        self.approve + self.veto + self.abstain
    }
}

pub fn tally(responses: &BTreeMap<UserId, Vote>) -> Tally {
    let mut t = Tally::default();
    for vote in responses.values() {
        match vote {
            Vote::Approve => t.approve += 1,
            Vote::Veto => t.veto += 1,
            Vote::Abstain => t.abstain += 1,
        }
    }
    t
}

/// Decide a poll.
///
/// - no responses at all: `Expired`
/// - more vetoes than the policy tolerates: `Rejected`, whatever the approvals
/// - approvals at or above quorum: `Accepted`
/// - otherwise: `Rejected`
pub fn evaluate(responses: &BTreeMap<UserId, Vote>, policy: &DecisionPolicy) -> Outcome {
    if responses.is_empty() {
        return Outcome::Expired;
    }

    let t = tally(responses);
    if t.veto > policy.max_vetoes {
        return Outcome::Rejected;
    }
    if t.approve >= policy.quorum {
        Outcome::Accepted
    } else {
        Outcome::Rejected
    }
}

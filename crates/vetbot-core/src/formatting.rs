//! Plain-text message builders for gateway output.

use crate::{
    decision::Tally,
    domain::{ChannelRef, UserId},
    session::{Outcome, VettingSession, Vote},
};

pub fn help_text(prefix: &str, topic: Option<&str>) -> String {
    match topic {
        None => format!(
            "Hello, I'm the vetting bot. Use `{prefix} help commands` to view available commands."
        ),
        Some("commands") => format!(
            "Available commands:\n\
             `{prefix} start <user_id>` open a vetting channel\n\
             `{prefix} vote <user_id>` close questions and open the poll\n\
             `{prefix} status <user_id>` show the session\n\
             `{prefix} cancel <user_id>` cancel the session\n\
             In a vetting channel the candidate sends `{prefix} done` when finished."
        ),
        Some(_) => "Unknown help topic!".to_string(),
    }
}

pub fn usage_text(prefix: &str, command: &str) -> String {
    format!(
        "Usage: `{prefix} {command} <user_id>`\nExample: `{prefix} {command} @someone:example.com`"
    )
}

pub fn unknown_command_text(prefix: &str, name: &str) -> String {
    format!("Unknown command '{name}'. Try the '{prefix} help' command for more information.")
}

pub fn status_text(session: &VettingSession, tally: &Tally) -> String {
    let mut out = format!(
        "Vetting for `{}`: {}\nChannel: {}\nQuestions asked: {}",
        session.candidate_id,
        session.state,
        session.channel_ref,
        session.questions_asked.len()
    );
    if let Some(deadline) = session.poll_deadline {
        out.push_str(&format!(
            "\nPoll closes: {}",
            deadline.format("%Y-%m-%d %H:%M UTC")
        ));
        out.push_str(&format!("\nVotes so far: {}", tally.total()));
    }
    if let Some(outcome) = session.outcome {
        out.push_str(&format!("\nOutcome: {outcome}"));
    }
    out
}

pub fn no_session_text(candidate: &UserId) -> String {
    format!("There is no vetting session for `{candidate}`.")
}

pub fn session_exists_text(candidate: &UserId, state: &str) -> String {
    format!("A vetting session already exists for `{candidate}` ({state}).")
}

pub fn started_text(candidate: &UserId, channel: &ChannelRef) -> String {
    format!("Vetting channel {channel} opened for `{candidate}`.")
}

pub fn command_rejected_text(command: &str, candidate: &UserId, state: &str) -> String {
    format!("Can't {command} `{candidate}` while the session is {state}.")
}

/// The decision announcement posted in the moderation channel.
pub fn decision_text(candidate: &UserId, outcome: Outcome, tally: &Tally) -> String {
    let counts = [
        (Vote::Approve, tally.approve),
        (Vote::Veto, tally.veto),
        (Vote::Abstain, tally.abstain),
    ]
    .into_iter()
    .map(|(vote, n)| format!("\n{}: {n};", title(vote.as_answer())))
    .collect::<String>();

    let verdict = match outcome {
        Outcome::Accepted => "Requirements met, inviting to the main space.",
        Outcome::Rejected => "Votes do not match the requirements, not inviting.",
        Outcome::Expired => "Nobody voted, not inviting.",
    };
    format!("Voting for `{candidate}` has ended. Counted votes are:\n{counts}\n\n{verdict}")
}

pub fn welcome_text(user: &UserId) -> String {
    format!("Welcome {user}! You have been accepted and invited to the main space.")
}

pub fn refusal_text(candidate: &UserId, outcome: Outcome) -> String {
    match outcome {
        Outcome::Expired => format!(
            "Sorry {candidate}, the vetting poll closed without any votes. You have not been admitted."
        ),
        _ => format!("Sorry {candidate}, the community decided not to admit you this time."),
    }
}

pub fn cancellation_text(candidate: &UserId) -> String {
    format!("The vetting process for {candidate} has been cancelled by a moderator.")
}

/// Cut `text` to at most `max_len` chars, marking the cut.
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let mut out: String = text.chars().take(keep).collect();
    out.push_str("...");
    out
}

fn title(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

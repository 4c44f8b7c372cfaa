//! Command parsing for prefixed chat messages (`!c start @someone:server`).

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::UserId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Open a vetting session for a candidate.
    Start(UserId),
    /// Close the Q&A phase and open the poll.
    Vote(UserId),
    Cancel(UserId),
    Status(UserId),
    /// Sent by the candidate inside their vetting channel.
    Done,
    Help(Option<String>),
    /// A known command with a missing or malformed argument.
    Usage { command: &'static str },
    Unknown(String),
}

impl Command {
    /// Commands that name a candidate.
    pub fn target(&self) -> Option<&UserId> {
        match self {
            Command::Start(u) | Command::Vote(u) | Command::Cancel(u) | Command::Status(u) => {
                Some(u)
            }
            _ => None,
        }
    }
}

/// Parse a message body. `None` when the message doesn't carry the prefix.
pub fn parse_command(body: &str, prefix: &str) -> Option<Command> {
    let body = body.trim();
    let rest = body.strip_prefix(prefix)?;
    // `!cfoo` is not the `!c` prefix.
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let mut parts = rest.split_whitespace();
    let Some(name) = parts.next() else {
        return Some(Command::Help(None));
    };
    let name = name.to_lowercase();
    let arg = parts.next();

    let with_user = |command: &'static str, build: fn(UserId) -> Command| match arg {
        Some(raw) if is_valid_user_id(raw) => build(UserId(raw.to_string())),
        _ => Command::Usage { command },
    };

    Some(match name.as_str() {
        "start" => with_user("start", Command::Start),
        "vote" => with_user("vote", Command::Vote),
        "cancel" => with_user("cancel", Command::Cancel),
        "status" => with_user("status", Command::Status),
        "done" => Command::Done,
        "help" => Command::Help(arg.map(|s| s.to_lowercase())),
        _ => Command::Unknown(name),
    })
}

/// `@localpart:server[:port]`, where server is a hostname, IPv4 or bracketed IPv6.
pub fn is_valid_user_id(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^@[!-9;-~]*:((\d{1,3}\.){3}\d{1,3}|\[[0-9A-Fa-f:.]{2,45}\]|[0-9A-Za-z.-]{1,255})(:\d{1,5})?$",
        )
        .expect("valid regex")
    })
    .is_match(s)
}

/// `!opaque:server`.
pub fn is_valid_channel_id(s: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^![^:\s]+:\S+$").expect("valid regex")
    })
    .is_match(s)
}

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    commands::{is_valid_channel_id, is_valid_user_id},
    decision::DecisionPolicy,
    domain::{ChannelRef, UserId},
    errors::Error,
    machine::VettingMachine,
    messaging::throttled::ThrottleConfig,
    Result,
};

const DEFAULT_POLL_WINDOW: Duration = Duration::from_secs(36 * 3600);
const MAX_POLL_WINDOW: Duration = Duration::from_secs(365 * 24 * 3600);

/// Typed configuration, read from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Accounts and rooms
    pub bot_user_id: UserId,
    pub moderation_channel: ChannelRef,
    pub main_space: ChannelRef,
    pub moderators: Vec<UserId>,
    pub command_prefix: String,

    // Decision policy
    pub quorum: u32,
    pub max_veto_votes: u32,
    pub poll_window: Duration,

    // Persistence
    pub store_path: PathBuf,
    pub cas_retries: u32,
    pub audit_log_path: Option<PathBuf>,

    // Outbound flood control
    pub throttle: ThrottleConfig,
}

impl Config {
    /// Defaults for everything except the three required ids.
    pub fn new(bot_user_id: UserId, moderation_channel: ChannelRef, main_space: ChannelRef) -> Self {
        Self {
            bot_user_id,
            moderation_channel,
            main_space,
            moderators: Vec::new(),
            command_prefix: "!c".to_string(),
            quorum: 2,
            max_veto_votes: 0,
            poll_window: DEFAULT_POLL_WINDOW,
            store_path: PathBuf::from("vetbot-sessions.json"),
            cas_retries: 5,
            audit_log_path: None,
            throttle: ThrottleConfig::default(),
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from any key lookup (the process env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        let bot_user_id = UserId(required(&get, "VETBOT_USER_ID")?);
        if !is_valid_user_id(&bot_user_id.0) {
            return Err(Error::Config(
                "VETBOT_USER_ID must be in the form @name:server".to_string(),
            ));
        }

        let moderation_channel = ChannelRef(required(&get, "VETBOT_MODERATION_CHANNEL")?);
        let main_space = ChannelRef(required(&get, "VETBOT_MAIN_SPACE")?);
        for (key, channel) in [
            ("VETBOT_MODERATION_CHANNEL", &moderation_channel),
            ("VETBOT_MAIN_SPACE", &main_space),
        ] {
            if !is_valid_channel_id(&channel.0) {
                return Err(Error::Config(format!(
                    "{key} must be in the form !room:server"
                )));
            }
        }

        let mut cfg = Self::new(bot_user_id, moderation_channel, main_space);

        cfg.moderators = parse_csv(get("VETBOT_MODERATORS"))
            .into_iter()
            .map(UserId)
            .collect();
        if let Some(bad) = cfg.moderators.iter().find(|u| !is_valid_user_id(&u.0)) {
            return Err(Error::Config(format!(
                "VETBOT_MODERATORS contains an invalid user id: {bad}"
            )));
        }

        if let Some(prefix) = get("VETBOT_COMMAND_PREFIX") {
            cfg.command_prefix = prefix.trim().to_string();
        }

        if let Some(q) = parse_num::<u32>(&get, "VETBOT_QUORUM")? {
            cfg.quorum = q;
        }
        if cfg.quorum == 0 {
            return Err(Error::Config("VETBOT_QUORUM must be at least 1".to_string()));
        }
        if let Some(v) = parse_num::<u32>(&get, "VETBOT_MAX_VETO_VOTES")? {
            cfg.max_veto_votes = v;
        }

        if let Some(secs) = parse_num::<u64>(&get, "VETBOT_POLL_WINDOW_SECS")? {
            cfg.poll_window = Duration::from_secs(secs);
        }
        if cfg.poll_window.is_zero() || cfg.poll_window > MAX_POLL_WINDOW {
            return Err(Error::Config(
                "VETBOT_POLL_WINDOW_SECS must be between 1 and 31536000".to_string(),
            ));
        }

        if let Some(path) = get("VETBOT_STORE_PATH") {
            cfg.store_path = PathBuf::from(path);
        }
        if let Some(n) = parse_num::<u32>(&get, "VETBOT_CAS_RETRIES")? {
            cfg.cas_retries = n.max(1);
        }
        cfg.audit_log_path = get("VETBOT_AUDIT_LOG_PATH").map(PathBuf::from);

        if let Some(ms) = parse_num::<u64>(&get, "VETBOT_GLOBAL_MIN_INTERVAL_MS")? {
            cfg.throttle.global_min_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_num::<u64>(&get, "VETBOT_PER_CHANNEL_MIN_INTERVAL_MS")? {
            cfg.throttle.per_channel_min_interval = Duration::from_millis(ms);
        }

        Ok(cfg)
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            quorum: self.quorum,
            max_vetoes: self.max_veto_votes,
        }
    }

    pub fn machine(&self) -> VettingMachine {
        VettingMachine::new(self.decision_policy(), self.poll_window)
    }

    /// Empty allowlist: everyone in the moderation channel may issue commands.
    pub fn is_moderator(&self, user: &UserId) -> bool {
        self.moderators.is_empty() || self.moderators.contains(user)
    }
}

fn required(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<String> {
    get(key).ok_or_else(|| Error::Config(format!("{key} environment variable is required")))
}

fn parse_num<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<T>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(s: &str) -> &str {
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        return &s[1..s.len() - 1];
    }
    s
}

fn parse_csv(v: Option<String>) -> Vec<String> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    const BASE: [(&str, &str); 3] = [
        ("VETBOT_USER_ID", "@vetbot:example.org"),
        ("VETBOT_MODERATION_CHANNEL", "!mods:example.org"),
        ("VETBOT_MAIN_SPACE", "!main:example.org"),
    ];

    #[test]
    fn defaults_apply_when_only_required_keys_are_set() {
        let cfg = Config::from_lookup(lookup(&BASE)).unwrap();
        assert_eq!(cfg.quorum, 2);
        assert_eq!(cfg.max_veto_votes, 0);
        assert_eq!(cfg.poll_window, Duration::from_secs(129_600));
        assert_eq!(cfg.command_prefix, "!c");
        assert_eq!(cfg.cas_retries, 5);
        assert!(cfg.audit_log_path.is_none());
        assert!(cfg.is_moderator(&UserId("@anyone:example.org".to_string())));
    }

    #[test]
    fn missing_required_key_is_config_error() {
        let err = Config::from_lookup(lookup(&BASE[..2])).unwrap_err();
        assert!(matches!(err, Error::Config(ref m) if m.contains("VETBOT_MAIN_SPACE")));
    }

    #[test]
    fn rejects_malformed_ids() {
        let mut pairs = BASE.to_vec();
        pairs[0] = ("VETBOT_USER_ID", "vetbot");
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = BASE.to_vec();
        pairs[1] = ("VETBOT_MODERATION_CHANNEL", "#mods:example.org");
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn parses_policy_and_moderators() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("VETBOT_QUORUM", "3"),
            ("VETBOT_MAX_VETO_VOTES", "1"),
            ("VETBOT_POLL_WINDOW_SECS", "60"),
            ("VETBOT_MODERATORS", "@a:example.org, @b:example.org"),
            ("VETBOT_AUDIT_LOG_PATH", "/tmp/vetbot-audit.log"),
        ]);
        let cfg = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(
            cfg.decision_policy(),
            DecisionPolicy {
                quorum: 3,
                max_vetoes: 1
            }
        );
        assert_eq!(cfg.poll_window, Duration::from_secs(60));
        assert!(cfg.is_moderator(&UserId("@b:example.org".to_string())));
        assert!(!cfg.is_moderator(&UserId("@c:example.org".to_string())));
        assert_eq!(
            cfg.audit_log_path,
            Some(PathBuf::from("/tmp/vetbot-audit.log"))
        );
    }

    #[test]
    fn zero_quorum_and_bad_numbers_are_rejected() {
        let mut pairs = BASE.to_vec();
        pairs.push(("VETBOT_QUORUM", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());

        let mut pairs = BASE.to_vec();
        pairs.push(("VETBOT_POLL_WINDOW_SECS", "soon"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn strips_dotenv_quotes() {
        assert_eq!(strip_quotes("\"x\""), "x");
        assert_eq!(strip_quotes("'y'"), "y");
        assert_eq!(strip_quotes("z"), "z");
    }
}

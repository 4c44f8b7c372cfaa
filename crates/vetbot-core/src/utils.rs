use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;

use crate::{
    domain::{SessionId, UserId, Version},
    machine::{Transition, VettingEvent},
    Result,
};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for logs/audit lines).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

// ============== Audit Logging ==============

/// One line of the audit trail.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    /// `transition` or `rejected`.
    pub kind: String,
    pub session: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<UserId>,
    /// Previous state; absent when the event created the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub event: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub intents: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    pub fn transition(event: &VettingEvent, t: &Transition, version: Version) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            kind: "transition".to_string(),
            session: t.session.session_id.clone(),
            candidate: Some(t.session.candidate_id.clone()),
            from: t.from.map(|s| s.as_str().to_string()),
            to: Some(t.session.state.as_str().to_string()),
            event: event.kind().to_string(),
            intents: t.intents.iter().map(|i| i.kind().to_string()).collect(),
            version: Some(version),
            reason: None,
        }
    }

    /// An event the machine refused (illegal or duplicate).
    pub fn rejected(session: &SessionId, event: &VettingEvent, reason: &str) -> Self {
        Self {
            timestamp: iso_timestamp_utc(),
            kind: "rejected".to_string(),
            session: session.clone(),
            candidate: None,
            from: None,
            to: None,
            event: event.kind().to_string(),
            intents: Vec::new(),
            version: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Appends [`AuditEvent`]s to a file as JSON lines.
#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

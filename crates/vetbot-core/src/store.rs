//! Session store: versioned records with compare-and-swap writes.
//!
//! All mutation goes through read-version, compute-next-state, CAS-write. A
//! stale version makes `put` fail with `Conflict`; the caller re-reads and
//! retries the whole transition.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    domain::{ChannelRef, SessionId, Version, Versioned},
    errors::Error,
    session::VettingSession,
    Result,
};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `Error::NotFound` when no record exists.
    async fn get(&self, id: &SessionId) -> Result<Versioned<VettingSession>>;

    /// Write `session` if the stored version equals `expected`.
    ///
    /// `expected = None` means "create": it fails with `Conflict` when a record
    /// already exists. Returns the new version.
    async fn put(&self, session: VettingSession, expected: Option<Version>) -> Result<Version>;

    async fn list(&self) -> Result<Vec<Versioned<VettingSession>>>;

    /// The session whose vetting channel is `channel`, if any.
    ///
    /// The default scans `list`; the bundled stores answer from an index.
    async fn find_by_channel(&self, channel: &ChannelRef) -> Result<Option<SessionId>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|r| &r.value.channel_ref == channel)
            .map(|r| r.value.session_id))
    }
}

/// Records keyed by session, plus a channel index so routing a vetting
/// channel message doesn't scan every record.
#[derive(Clone, Default)]
struct Records {
    by_id: HashMap<SessionId, Versioned<VettingSession>>,
    by_channel: HashMap<ChannelRef, SessionId>,
}

impl Records {
    fn from_sessions(sessions: Vec<Versioned<VettingSession>>) -> Self {
        let mut records = Self::default();
        for r in sessions {
            records.insert(r);
        }
        records
    }

    fn get(&self, id: &SessionId) -> Result<Versioned<VettingSession>> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.clone()))
    }

    fn find_by_channel(&self, channel: &ChannelRef) -> Option<SessionId> {
        self.by_channel.get(channel).cloned()
    }

    fn insert(&mut self, record: Versioned<VettingSession>) {
        let id = record.value.session_id.clone();
        if let Some(old) = self.by_id.get(&id) {
            if old.value.channel_ref != record.value.channel_ref {
                self.by_channel.remove(&old.value.channel_ref);
            }
        }
        self.by_channel
            .insert(record.value.channel_ref.clone(), id.clone());
        self.by_id.insert(id, record);
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }

    fn sorted(&self) -> Vec<Versioned<VettingSession>> {
        let mut out: Vec<_> = self.by_id.values().cloned().collect();
        out.sort_by(|a, b| a.value.session_id.cmp(&b.value.session_id));
        out
    }
}

fn compare_and_swap(
    records: &mut Records,
    session: VettingSession,
    expected: Option<Version>,
) -> Result<Version> {
    let id = session.session_id.clone();
    let actual = records.by_id.get(&id).map(|r| r.version);
    if actual != expected {
        debug!(session = %id, ?expected, ?actual, "cas conflict");
        return Err(Error::Conflict {
            session: id,
            expected,
            actual,
        });
    }

    let version = actual.map(Version::next).unwrap_or(Version::INITIAL);
    records.insert(Versioned {
        version,
        value: session,
    });
    Ok(version)
}

/// In-process store. Loses everything on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, id: &SessionId) -> Result<Versioned<VettingSession>> {
        self.records.lock().await.get(id)
    }

    async fn put(&self, session: VettingSession, expected: Option<Version>) -> Result<Version> {
        let mut records = self.records.lock().await;
        compare_and_swap(&mut records, session, expected)
    }

    async fn list(&self) -> Result<Vec<Versioned<VettingSession>>> {
        Ok(self.records.lock().await.sorted())
    }

    async fn find_by_channel(&self, channel: &ChannelRef) -> Result<Option<SessionId>> {
        Ok(self.records.lock().await.find_by_channel(channel))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFileData {
    sessions: Vec<Versioned<VettingSession>>,
}

/// Store backed by a single JSON file, rewritten atomically on every put.
///
/// Records are cached in memory; the file is the durable copy read at open.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = load_store_file(&path).await?;
        let records = Records::from_sessions(data.sessions);
        debug!(path = %path.display(), sessions = records.len(), "session store opened");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionStore for JsonFileStore {
    async fn get(&self, id: &SessionId) -> Result<Versioned<VettingSession>> {
        self.records.lock().await.get(id)
    }

    async fn put(&self, session: VettingSession, expected: Option<Version>) -> Result<Version> {
        let mut records = self.records.lock().await;

        // Stage on a copy so a failed write leaves the cache matching the file.
        let mut staged = records.clone();
        let version = compare_and_swap(&mut staged, session, expected)?;
        let data = StoreFileData {
            sessions: staged.sorted(),
        };
        save_store_file(&self.path, &data)
            .await
            .map_err(|e| Error::StoreUnavailable(format!("{}: {e}", self.path.display())))?;

        *records = staged;
        Ok(version)
    }

    async fn list(&self) -> Result<Vec<Versioned<VettingSession>>> {
        Ok(self.records.lock().await.sorted())
    }

    async fn find_by_channel(&self, channel: &ChannelRef) -> Result<Option<SessionId>> {
        Ok(self.records.lock().await.find_by_channel(channel))
    }
}

async fn load_store_file(path: &Path) -> Result<StoreFileData> {
    let txt = match tokio::fs::read_to_string(path).await {
        Ok(txt) => txt,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFileData::default()),
        Err(e) => return Err(Error::StoreUnavailable(format!("{}: {e}", path.display()))),
    };
    if txt.trim().is_empty() {
        return Ok(StoreFileData::default());
    }
    Ok(serde_json::from_str(&txt)?)
}

async fn save_store_file(path: &Path, data: &StoreFileData) -> Result<()> {
    let txt = serde_json::to_string_pretty(data)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, txt).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

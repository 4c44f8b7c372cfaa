//! Deadline scheduler.
//!
//! Deadlines are data: each `PollOpen` session carries its `poll_deadline`.
//! This scheduler only turns those timestamps into `TimerFired` events:
//! - one tokio task per pending deadline, cancellable
//! - `recover` re-derives every pending deadline from the store at startup,
//!   firing immediately when the deadline has already passed
//! - a (session, deadline) pair fires at most once per process; a duplicate
//!   that slips through (e.g. across a crash) is rejected by the machine
//! - the fired marker is kept per session and dropped on `cancel`/`forget`,
//!   so the state stays proportional to the open sessions

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{domain::SessionId, machine::VettingEvent, store::SessionStore, Result};

#[derive(Clone)]
pub struct DeadlineScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    events: mpsc::Sender<VettingEvent>,
    state: Mutex<SchedulerState>,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<SessionId, JobEntry>,
    /// Last deadline fired per session.
    fired: HashMap<SessionId, DateTime<Utc>>,
}

struct JobEntry {
    fires_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeadlineScheduler {
    /// Timer events are sent on `events`; the engine feeds them to the machine.
    pub fn new(events: mpsc::Sender<VettingEvent>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                events,
                state: Mutex::new(SchedulerState::default()),
            }),
        }
    }

    /// Arm (or re-arm) the deadline for `session`.
    ///
    /// No-op when the same deadline is already pending or has already fired.
    pub async fn schedule(&self, session: SessionId, fires_at: DateTime<Utc>) {
        let mut st = self.inner.state.lock().await;
        if st.fired.get(&session) == Some(&fires_at) {
            debug!(session = %session, %fires_at, "deadline already fired, not re-arming");
            return;
        }
        if let Some(job) = st.jobs.get(&session) {
            if job.fires_at == fires_at {
                return;
            }
        }
        if let Some(old) = st.jobs.remove(&session) {
            old.cancel.cancel();
            old.handle.abort();
        }

        let cancel = CancellationToken::new();
        let scheduler = self.clone();
        let cancel_clone = cancel.clone();
        let session_clone = session.clone();
        let handle = tokio::spawn(async move {
            scheduler
                .wait_and_fire(session_clone, fires_at, cancel_clone)
                .await;
        });

        debug!(session = %session, %fires_at, "deadline scheduled");
        st.jobs.insert(
            session,
            JobEntry {
                fires_at,
                cancel,
                handle,
            },
        );
    }

    pub async fn cancel(&self, session: &SessionId) {
        let mut st = self.inner.state.lock().await;
        st.fired.remove(session);
        if let Some(job) = st.jobs.remove(session) {
            job.cancel.cancel();
            job.handle.abort();
            debug!(session = %session, "deadline cancelled");
        }
    }

    /// Drop the fired marker of a session that reached a terminal state.
    ///
    /// A terminal session has no pending deadline, so `recover` never re-arms it.
    pub async fn forget(&self, session: &SessionId) {
        self.inner.state.lock().await.fired.remove(session);
    }

    /// Re-arm every pending deadline found in the store. Returns how many.
    pub async fn recover(&self, store: &dyn SessionStore) -> Result<usize> {
        let mut armed = 0usize;
        for record in store.list().await? {
            let Some(deadline) = record.value.pending_deadline() else {
                continue;
            };
            self.schedule(record.value.session_id.clone(), deadline).await;
            armed += 1;
        }
        info!(armed, "deadlines recovered from store");
        Ok(armed)
    }

    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.jobs.len()
    }

    #[cfg(test)]
    pub(crate) async fn fired_count(&self) -> usize {
        self.inner.state.lock().await.fired.len()
    }

    pub async fn stop(&self) {
        let mut st = self.inner.state.lock().await;
        for (_, job) in st.jobs.drain() {
            job.cancel.cancel();
            job.handle.abort();
        }
    }

    async fn wait_and_fire(
        &self,
        session: SessionId,
        fires_at: DateTime<Utc>,
        cancel: CancellationToken,
    ) {
        let dur = (fires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
          _ = cancel.cancelled() => return,
          _ = sleep(dur) => {}
        }

        {
            let mut st = self.inner.state.lock().await;
            if cancel.is_cancelled() || st.fired.get(&session) == Some(&fires_at) {
                return;
            }
            st.fired.insert(session.clone(), fires_at);
            if st.jobs.get(&session).is_some_and(|j| j.fires_at == fires_at) {
                st.jobs.remove(&session);
            }
        }

        info!(session = %session, %fires_at, "deadline reached");
        let event = VettingEvent::TimerFired {
            session_id: session.clone(),
        };
        if self.inner.events.send(event).await.is_err() {
            warn!(session = %session, "timer channel closed, TimerFired dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChannelRef, UserId},
        session::{SessionState, VettingSession},
        store::MemoryStore,
    };

    async fn recv_within(rx: &mut mpsc::Receiver<VettingEvent>, ms: u64) -> Option<VettingEvent> {
        tokio::time::timeout(Duration::from_millis(ms), rx.recv())
            .await
            .ok()
            .flatten()
    }

    fn poll_open_session(name: &str, deadline: DateTime<Utc>) -> VettingSession {
        let candidate = UserId(format!("@{name}:x"));
        let mut s = VettingSession::new(
            SessionId::for_candidate(&candidate),
            candidate,
            ChannelRef(format!("!{name}:x")),
            deadline - chrono::Duration::hours(36),
        );
        s.state = SessionState::PollOpen;
        s.poll_opened_at = Some(s.created_at);
        s.poll_deadline = Some(deadline);
        s
    }

    #[tokio::test]
    async fn fires_once_at_deadline() {
        let (tx, mut rx) = mpsc::channel(8);
        let sched = DeadlineScheduler::new(tx);
        let sid = SessionId("vetting:@a:x".to_string());
        sched
            .schedule(sid.clone(), Utc::now() + chrono::Duration::milliseconds(20))
            .await;

        let ev = recv_within(&mut rx, 500).await;
        assert_eq!(ev, Some(VettingEvent::TimerFired { session_id: sid }));
        assert_eq!(recv_within(&mut rx, 100).await, None);
        assert_eq!(sched.pending().await, 0);
    }

    #[tokio::test]
    async fn cancelled_deadline_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let sched = DeadlineScheduler::new(tx);
        let sid = SessionId("vetting:@a:x".to_string());
        sched
            .schedule(sid.clone(), Utc::now() + chrono::Duration::milliseconds(50))
            .await;
        sched.cancel(&sid).await;
        assert_eq!(recv_within(&mut rx, 150).await, None);
    }

    #[tokio::test]
    async fn rescheduling_same_deadline_is_a_noop() {
        let (tx, mut rx) = mpsc::channel(8);
        let sched = DeadlineScheduler::new(tx);
        let sid = SessionId("vetting:@a:x".to_string());
        let at = Utc::now() + chrono::Duration::milliseconds(20);
        sched.schedule(sid.clone(), at).await;
        sched.schedule(sid.clone(), at).await;
        assert_eq!(sched.pending().await, 1);

        assert!(recv_within(&mut rx, 500).await.is_some());
        sched.schedule(sid, at).await;
        assert_eq!(recv_within(&mut rx, 100).await, None);
    }

    #[tokio::test]
    async fn fired_markers_are_dropped_on_cancel_and_forget() {
        let (tx, mut rx) = mpsc::channel(8);
        let sched = DeadlineScheduler::new(tx);
        let a = SessionId("vetting:@a:x".to_string());
        let b = SessionId("vetting:@b:x".to_string());
        let at = Utc::now() - chrono::Duration::seconds(1);
        sched.schedule(a.clone(), at).await;
        sched.schedule(b.clone(), at).await;
        assert!(recv_within(&mut rx, 500).await.is_some());
        assert!(recv_within(&mut rx, 500).await.is_some());
        assert_eq!(sched.fired_count().await, 2);

        sched.forget(&a).await;
        sched.cancel(&b).await;
        assert_eq!(sched.fired_count().await, 0);

        // A new deadline for the same session replaces the marker.
        let later = Utc::now() + chrono::Duration::milliseconds(10);
        sched.schedule(a.clone(), later).await;
        assert!(recv_within(&mut rx, 500).await.is_some());
        let st = sched.inner.state.lock().await;
        assert_eq!(st.fired.len(), 1);
        assert_eq!(st.fired.get(&a), Some(&later));
    }

    #[tokio::test]
    async fn restart_fires_past_deadline_exactly_once() {
        let store = MemoryStore::new();
        let past = poll_open_session("late", Utc::now() - chrono::Duration::minutes(5));
        let future = poll_open_session("later", Utc::now() + chrono::Duration::hours(1));
        let mut done = poll_open_session("done", Utc::now() - chrono::Duration::minutes(5));
        done.state = SessionState::Rejected;
        for s in [past.clone(), future, done] {
            store.put(s, None).await.unwrap();
        }

        let (tx, mut rx) = mpsc::channel(8);
        let sched = DeadlineScheduler::new(tx);
        assert_eq!(sched.recover(&store).await.unwrap(), 2);
        // A second scan (e.g. a reconnect) must not double-fire.
        sched.recover(&store).await.unwrap();

        let ev = recv_within(&mut rx, 500).await;
        assert_eq!(
            ev,
            Some(VettingEvent::TimerFired {
                session_id: past.session_id
            })
        );
        assert_eq!(recv_within(&mut rx, 150).await, None);
        assert_eq!(sched.pending().await, 1);
        sched.stop().await;
        assert_eq!(sched.pending().await, 0);
    }
}

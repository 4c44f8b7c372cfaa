//! The event loop: deliveries and timer firings in, CAS-committed transitions
//! and gateway calls out.
//!
//! Every mutation follows read-version, transition, compare-and-swap. A lost
//! race re-reads and recomputes; nothing holds a lock across I/O. Intents are
//! executed only after the commit succeeds, best-effort.
//!
//! Work for one session runs in arrival order; different sessions run
//! concurrently.

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    commands::Command,
    config::Config,
    decision::tally,
    domain::{ChannelRef, SessionId, UserId},
    errors::Error,
    formatting,
    machine::{Intent, ModeratorCommandKind, Transition, VettingEvent, VettingMachine},
    messaging::{
        port::MessagingGateway,
        types::{ChannelRequest, Delivery, PollSpec, RawEvent},
    },
    normalizer::{normalize, route, Route},
    scheduler::DeadlineScheduler,
    store::SessionStore,
    utils::{AuditEvent, AuditLogger},
    Result,
};

/// Delay before a timer that hit an unavailable store is tried again.
const TIMER_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct VettingEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    cfg: Arc<Config>,
    machine: VettingMachine,
    store: Arc<dyn SessionStore>,
    gateway: Arc<dyn MessagingGateway>,
    scheduler: DeadlineScheduler,
    audit: Option<AuditLogger>,
}

impl VettingEngine {
    pub fn new(
        cfg: Arc<Config>,
        store: Arc<dyn SessionStore>,
        gateway: Arc<dyn MessagingGateway>,
        scheduler: DeadlineScheduler,
    ) -> Self {
        let audit = cfg.audit_log_path.clone().map(AuditLogger::new);
        Self {
            inner: Arc::new(EngineInner {
                machine: cfg.machine(),
                cfg,
                store,
                gateway,
                scheduler,
                audit,
            }),
        }
    }

    /// Re-arm deadlines persisted by a previous run.
    pub async fn recover(&self) -> Result<usize> {
        self.inner
            .scheduler
            .recover(self.inner.store.as_ref())
            .await
    }

    /// Process deliveries and timer events until the inbound stream ends or
    /// `shutdown` fires. Each item runs in its own task, queued behind earlier
    /// work for the same session; in-flight tasks are drained before returning.
    pub async fn run(
        &self,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut timers: mpsc::Receiver<VettingEvent>,
        shutdown: CancellationToken,
    ) {
        let mut tasks = JoinSet::new();
        let mut lanes = Lanes::default();
        loop {
            tokio::select! {
              _ = shutdown.cancelled() => {
                info!("shutdown requested");
                break;
              }
              d = deliveries.recv() => {
                let Some(delivery) = d else {
                  info!("inbound stream ended");
                  break;
                };
                // Resolved here, in arrival order, so the lane reflects the
                // order deliveries came in.
                let lane = self.lane_for(&delivery.event).await;
                let engine = self.clone();
                tasks.spawn(lanes.enter(lane).run(async move {
                  let _ = engine.handle_delivery(delivery).await;
                }));
              }
              Some(event) = timers.recv() => {
                let lane = match &event {
                  VettingEvent::TimerFired { session_id } => Some(session_id.clone()),
                  _ => None,
                };
                let engine = self.clone();
                tasks.spawn(lanes.enter(lane).run(async move {
                  let _ = engine.handle_timer(event).await;
                }));
              }
              Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                  error!("engine task panicked: {e}");
                }
              }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("engine task panicked: {e}");
            }
        }
    }

    /// The session a raw event will be applied to, when it can be told up front.
    ///
    /// Lookup failures give `None`; the handler hits the same failure and
    /// deals with it.
    async fn lane_for(&self, raw: &RawEvent) -> Option<SessionId> {
        match route(raw, &self.inner.cfg) {
            Route::Drop(_) => None,
            Route::Command { command, .. } => command.target().map(SessionId::for_candidate),
            Route::Session(id) => Some(id),
            Route::Channel(channel) => self
                .inner
                .store
                .find_by_channel(&channel)
                .await
                .ok()
                .flatten(),
        }
    }

    /// Handle one inbound delivery and acknowledge it.
    ///
    /// Only a retryable failure (store unavailable) leaves the delivery
    /// unacknowledged, so the gateway delivers it again later.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        match self.dispatch(&delivery.event).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                error!(delivery = %delivery.id, "delivery left unacknowledged: {e}");
                return Err(e);
            }
            Err(e) => log_dropped(&e),
        }

        if let Err(e) = self.inner.gateway.ack(&delivery.id).await {
            warn!(delivery = %delivery.id, "ack failed: {e}");
        }
        Ok(())
    }

    /// Feed a scheduler event to the machine.
    pub async fn handle_timer(&self, event: VettingEvent) -> Result<()> {
        let VettingEvent::TimerFired { session_id } = &event else {
            debug!(event = event.kind(), "non-timer event on the timer channel, dropped");
            return Ok(());
        };
        let session_id = session_id.clone();

        match self.apply(&session_id, event).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => {
                error!(session = %session_id, "deadline not applied, retrying later: {e}");
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(TIMER_RETRY_DELAY)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));
                self.inner.scheduler.schedule(session_id, retry_at).await;
                Err(e)
            }
            Err(e) => {
                log_dropped(&e);
                Ok(())
            }
        }
    }

    /// Read, transition, compare-and-swap; retry on conflict; then execute intents.
    pub async fn apply(&self, session_id: &SessionId, event: VettingEvent) -> Result<Transition> {
        let retries = self.inner.cfg.cas_retries.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let current = match self.inner.store.get(session_id).await {
                Ok(rec) => Some(rec),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };
            if current.is_none() && !matches!(event, VettingEvent::CandidateInvited { .. }) {
                return Err(Error::NotFound(session_id.clone()));
            }

            let transition = match self.inner.machine.transition(
                session_id,
                current.as_ref().map(|r| &r.value),
                &event,
                Utc::now(),
            ) {
                Ok(t) => t,
                Err(e) => {
                    self.audit(AuditEvent::rejected(session_id, &event, &e.to_string()));
                    return Err(e);
                }
            };

            let expected = current.map(|r| r.version);
            match self
                .inner
                .store
                .put(transition.session.clone(), expected)
                .await
            {
                Ok(version) => {
                    info!(
                        session = %session_id,
                        event = event.kind(),
                        from = transition.from.map(|s| s.as_str()).unwrap_or("none"),
                        to = transition.session.state.as_str(),
                        version = version.0,
                        "transition committed"
                    );
                    self.audit(AuditEvent::transition(&event, &transition, version));
                    if transition.session.state.is_terminal() {
                        self.inner.scheduler.forget(session_id).await;
                    }
                    self.execute(&transition.intents).await;
                    return Ok(transition);
                }
                Err(Error::Conflict { .. }) if attempt < retries => {
                    debug!(session = %session_id, attempt, "cas conflict, retrying");
                }
                Err(Error::Conflict { .. }) => {
                    return Err(Error::StoreUnavailable(format!(
                        "{session_id}: gave up after {attempt} conflicting writes"
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&self, raw: &RawEvent) -> Result<()> {
        let session_id = match route(raw, &self.inner.cfg) {
            Route::Drop(reason) => {
                debug!(reason, "inbound event dropped");
                return Ok(());
            }
            Route::Command { sender, command } => {
                return self.handle_command(&sender, command).await;
            }
            Route::Session(id) => id,
            Route::Channel(channel) => match self.inner.store.find_by_channel(&channel).await? {
                Some(id) => id,
                None => {
                    debug!(channel = %channel, "message in an unknown channel, dropped");
                    return Ok(());
                }
            },
        };

        let record = self.inner.store.get(&session_id).await?;
        let Some(event) = normalize(raw, &record.value, &self.inner.cfg) else {
            return Ok(());
        };
        self.apply(&session_id, event).await?;
        Ok(())
    }

    async fn handle_command(&self, sender: &UserId, command: Command) -> Result<()> {
        let prefix = self.inner.cfg.command_prefix.clone();
        debug!(sender = %sender, candidate = ?command.target(), "moderator command");

        match command {
            Command::Start(candidate) => self.start_vetting(candidate).await,
            Command::Vote(candidate) => {
                let sid = SessionId::for_candidate(&candidate);
                let result = self
                    .apply(&sid, VettingEvent::CandidateDoneWithQuestions)
                    .await;
                self.command_result("open the poll for", &candidate, result)
                    .await
            }
            Command::Cancel(candidate) => {
                let sid = SessionId::for_candidate(&candidate);
                let event = VettingEvent::ModeratorCommand {
                    kind: ModeratorCommandKind::Cancel,
                };
                let result = self.apply(&sid, event).await;
                self.command_result("cancel", &candidate, result).await
            }
            Command::Status(candidate) => {
                let sid = SessionId::for_candidate(&candidate);
                let text = match self.inner.store.get(&sid).await {
                    Ok(rec) => formatting::status_text(&rec.value, &tally(&rec.value.responses)),
                    Err(Error::NotFound(_)) => formatting::no_session_text(&candidate),
                    Err(e) => return Err(e),
                };
                self.reply(&text).await;
                Ok(())
            }
            Command::Help(topic) => {
                self.reply(&formatting::help_text(&prefix, topic.as_deref()))
                    .await;
                Ok(())
            }
            Command::Usage { command } => {
                self.reply(&formatting::usage_text(&prefix, command)).await;
                Ok(())
            }
            Command::Unknown(name) => {
                self.reply(&formatting::unknown_command_text(&prefix, &name))
                    .await;
                Ok(())
            }
            Command::Done => {
                debug!("`done` outside a vetting channel, ignored");
                Ok(())
            }
        }
    }

    async fn start_vetting(&self, candidate: UserId) -> Result<()> {
        let sid = SessionId::for_candidate(&candidate);
        match self.inner.store.get(&sid).await {
            Ok(existing) => {
                self.reply(&formatting::session_exists_text(
                    &candidate,
                    existing.value.state.as_str(),
                ))
                .await;
                return Ok(());
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if !self.inner.gateway.capabilities().supports_channel_creation {
            self.reply("This gateway cannot create vetting channels.").await;
            return Ok(());
        }

        let invitees = match self.invitees_for(&candidate).await {
            Ok(invitees) => invitees,
            Err(e) => {
                warn!(candidate = %candidate, "moderator lookup failed: {e}");
                self.reply(&format!("Unable to list moderators: {e}")).await;
                return Ok(());
            }
        };
        if invitees.is_empty() {
            warn!(candidate = %candidate, "vetting channel will have no moderators");
        }

        let req = ChannelRequest {
            session: sid.clone(),
            candidate: candidate.clone(),
            name: format!("Vetting {candidate}"),
            invitees,
        };
        let channel = match self.inner.gateway.create_or_resolve_channel(&req).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!(candidate = %candidate, "channel creation failed: {e}");
                self.reply(&format!("Unable to create channel: {e}")).await;
                return Ok(());
            }
        };

        let event = VettingEvent::CandidateInvited {
            candidate: candidate.clone(),
            channel: channel.clone(),
        };
        match self.apply(&sid, event).await {
            Ok(_) => {
                self.reply(&formatting::started_text(&candidate, &channel))
                    .await;
                Ok(())
            }
            other => self.command_result("start", &candidate, other).await,
        }
    }

    /// Who joins the vetting channel besides the candidate: the allowlist, or
    /// everyone in the moderation channel when the allowlist is empty.
    async fn invitees_for(&self, candidate: &UserId) -> Result<Vec<UserId>> {
        let cfg = &self.inner.cfg;
        let mut members = if cfg.moderators.is_empty() {
            self.inner
                .gateway
                .channel_members(&cfg.moderation_channel)
                .await?
        } else {
            cfg.moderators.clone()
        };
        members.retain(|u| u != candidate && *u != cfg.bot_user_id);
        members.dedup();
        Ok(members)
    }

    /// Turn a command's transition result into a reply. Store failures propagate.
    async fn command_result(
        &self,
        action: &str,
        candidate: &UserId,
        result: Result<Transition>,
    ) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(Error::NotFound(_)) => {
                self.reply(&formatting::no_session_text(candidate)).await;
                Ok(())
            }
            Err(Error::IllegalTransition { state, .. }) => {
                self.reply(&formatting::command_rejected_text(action, candidate, &state))
                    .await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn execute(&self, intents: &[Intent]) {
        for intent in intents {
            if let Err(e) = self.execute_one(intent).await {
                warn!(intent = intent.kind(), "intent failed: {e}");
            }
        }
    }

    async fn execute_one(&self, intent: &Intent) -> Result<()> {
        let cfg = &self.inner.cfg;
        let gateway = &self.inner.gateway;
        match intent {
            Intent::InviteToChannel { channel, user } => gateway.invite_user(channel, user).await,
            Intent::OpenPoll {
                session,
                candidate,
                deadline,
            } => {
                let poll = PollSpec::standard(session.clone(), candidate, *deadline);
                gateway.open_poll(&cfg.moderation_channel, &poll).await?;
                Ok(())
            }
            Intent::ScheduleDeadline { session, fires_at } => {
                self.inner
                    .scheduler
                    .schedule(session.clone(), *fires_at)
                    .await;
                Ok(())
            }
            Intent::CancelDeadline { session } => {
                self.inner.scheduler.cancel(session).await;
                Ok(())
            }
            Intent::ClosePoll { session } => {
                gateway.close_poll(&cfg.moderation_channel, session).await
            }
            Intent::AnnounceDecision {
                candidate,
                outcome,
                tally,
                ..
            } => {
                let text = formatting::decision_text(candidate, *outcome, tally);
                self.send(&cfg.moderation_channel, &text).await
            }
            Intent::InviteToMainSpace { user } => gateway.invite_user(&cfg.main_space, user).await,
            Intent::SendWelcome { channel, user } => {
                self.send(channel, &formatting::welcome_text(user)).await
            }
            Intent::NotifyRefusal {
                channel,
                candidate,
                outcome,
            } => {
                self.send(channel, &formatting::refusal_text(candidate, *outcome))
                    .await
            }
            Intent::NotifyCancellation { channel, candidate } => {
                self.send(channel, &formatting::cancellation_text(candidate))
                    .await
            }
        }
    }

    async fn send(&self, channel: &ChannelRef, text: &str) -> Result<()> {
        let max = self.inner.gateway.capabilities().max_message_len;
        let text = formatting::truncate_text(text, max);
        self.inner.gateway.send_message(channel, &text).await?;
        Ok(())
    }

    async fn reply(&self, text: &str) {
        if let Err(e) = self.send(&self.inner.cfg.moderation_channel, text).await {
            warn!("reply failed: {e}");
        }
    }

    fn audit(&self, event: AuditEvent) {
        let Some(logger) = &self.inner.audit else {
            return;
        };
        if let Err(e) = logger.write(&event) {
            warn!(path = %logger.path().display(), "audit write failed: {e}");
        }
    }
}

/// Per-session task chains.
///
/// Each session maps to a token cancelled when its latest task finishes; the
/// next task for that session waits on it first. Finished chains are pruned on
/// every `enter`.
#[derive(Default)]
struct Lanes {
    tails: HashMap<SessionId, CancellationToken>,
}

impl Lanes {
    fn enter(&mut self, lane: Option<SessionId>) -> LaneTicket {
        self.tails.retain(|_, done| !done.is_cancelled());
        let Some(session) = lane else {
            return LaneTicket::default();
        };
        let done = CancellationToken::new();
        let after = self.tails.insert(session, done.clone());
        LaneTicket {
            after,
            done: Some(done),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tails.len()
    }
}

#[derive(Default)]
struct LaneTicket {
    after: Option<CancellationToken>,
    done: Option<CancellationToken>,
}

impl LaneTicket {
    /// Run `work` once the previous task in the lane has finished.
    async fn run(self, work: impl Future<Output = ()>) {
        // Released on drop, so a panicking task doesn't stall its lane.
        let _done = self.done.map(CancellationToken::drop_guard);
        if let Some(prev) = self.after {
            prev.cancelled().await;
        }
        work.await;
    }
}

fn log_dropped(e: &Error) {
    match e {
        Error::IllegalTransition { .. } => info!("event rejected: {e}"),
        Error::NotFound(_) => debug!("event for unknown session dropped: {e}"),
        _ => warn!("event dropped: {e}"),
    }
}

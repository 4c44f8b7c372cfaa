use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChannelRef, DeliveryId, MessageRef, SessionId, UserId},
    messaging::{
        port::MessagingGateway,
        types::{ChannelRequest, GatewayCapabilities, PollSpec},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls touching the same channel.
    pub per_channel_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_channel_min_interval: Duration::from_millis(1050),
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }

    /// No slot reserved past `now`; a fresh limiter would behave the same.
    fn is_idle(&self, now: Instant) -> bool {
        now >= self.next
    }
}

/// Gateway decorator that rate-limits outbound calls.
///
/// Best-effort flood control: a burst of decisions (many deadlines passing at
/// once after a restart) is spread out instead of hitting the network together.
/// Acknowledgements are not throttled.
pub struct ThrottledGateway {
    inner: Arc<dyn MessagingGateway>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_channel: Mutex<HashMap<ChannelRef, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledGateway {
    pub fn new(inner: Arc<dyn MessagingGateway>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_channel: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_channel(&self, channel: &ChannelRef) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_channel.lock().await;
        let now = Instant::now();
        // Drop idle limiters nobody else holds; the map tracks busy channels only.
        map.retain(|_, lim| {
            Arc::strong_count(lim) > 1 || lim.try_lock().map_or(true, |l| !l.is_idle(now))
        });
        map.entry(channel.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_channel_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_channel(&self, channel: &ChannelRef) {
        let global_wait = { self.global.lock().await.reserve() };
        let channel_wait = {
            let lim = self.limiter_for_channel(channel).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(channel_wait);
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if wait > Duration::ZERO {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingGateway for ThrottledGateway {
    fn capabilities(&self) -> GatewayCapabilities {
        self.inner.capabilities()
    }

    async fn send_message(&self, channel: &ChannelRef, content: &str) -> Result<MessageRef> {
        self.throttle_channel(channel).await;
        self.inner.send_message(channel, content).await
    }

    async fn invite_user(&self, channel: &ChannelRef, user: &UserId) -> Result<()> {
        self.throttle_channel(channel).await;
        self.inner.invite_user(channel, user).await
    }

    async fn channel_members(&self, channel: &ChannelRef) -> Result<Vec<UserId>> {
        // Read-only; not throttled.
        self.inner.channel_members(channel).await
    }

    async fn create_or_resolve_channel(&self, req: &ChannelRequest) -> Result<ChannelRef> {
        // The channel doesn't exist yet; apply global throttling only.
        self.throttle_global().await;
        self.inner.create_or_resolve_channel(req).await
    }

    async fn open_poll(&self, channel: &ChannelRef, poll: &PollSpec) -> Result<MessageRef> {
        self.throttle_channel(channel).await;
        self.inner.open_poll(channel, poll).await
    }

    async fn close_poll(&self, channel: &ChannelRef, key: &SessionId) -> Result<()> {
        self.throttle_channel(channel).await;
        self.inner.close_poll(channel, key).await
    }

    async fn ack(&self, delivery: &DeliveryId) -> Result<()> {
        self.inner.ack(delivery).await
    }
}

//! Newline-delimited JSON gateway.
//!
//! This crate implements the `vetbot-core` MessagingGateway without a chat
//! network behind it:
//! - inbound: one [`Delivery`] per line on a reader (stdin in production)
//! - outbound: one action object per line on a writer (stdout), tagged `action`
//!
//! A bridge process on the other side translates to and from the real network
//! and writes back `ack`-able deliveries. Membership of watched channels is
//! learned from that same stream (see [`Roster`]); the bridge should replay the
//! current members as `joined` events when it connects.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vetbot_core::{
    domain::{ChannelRef, DeliveryId, MessageRef, SessionId, UserId},
    errors::Error,
    messaging::{
        port::MessagingGateway,
        types::{
            ChannelRequest, Delivery, GatewayCapabilities, Membership, PollSpec, RawEvent,
        },
    },
    Result,
};

const MAX_MESSAGE_LEN: usize = 32_000;

/// One outbound line.
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum Outbound<'a> {
    SendMessage {
        channel: &'a ChannelRef,
        event_id: String,
        content: &'a str,
    },
    InviteUser {
        channel: &'a ChannelRef,
        user: &'a UserId,
    },
    CreateChannel {
        channel: &'a ChannelRef,
        request: &'a ChannelRequest,
    },
    OpenPoll {
        channel: &'a ChannelRef,
        event_id: String,
        poll: &'a PollSpec,
    },
    ClosePoll {
        channel: &'a ChannelRef,
        key: &'a SessionId,
    },
    Ack {
        delivery: &'a DeliveryId,
    },
}

/// Members of the watched channels, as seen on the inbound stream.
///
/// `joined` adds a user, `left` removes one, and anyone sending a message or
/// a poll response in a watched channel is a member. Other channels are ignored.
#[derive(Debug)]
pub struct Roster {
    channels: Mutex<HashMap<ChannelRef, BTreeSet<UserId>>>,
}

impl Roster {
    pub fn watching(channels: impl IntoIterator<Item = ChannelRef>) -> Self {
        Self {
            channels: Mutex::new(
                channels
                    .into_iter()
                    .map(|c| (c, BTreeSet::new()))
                    .collect(),
            ),
        }
    }

    pub async fn observe(&self, event: &RawEvent) {
        let (channel, user, joined) = match event {
            RawEvent::Message(m) => (&m.channel, &m.sender, true),
            RawEvent::PollResponse(p) => (&p.channel, &p.sender, true),
            RawEvent::Membership(c) => match c.membership {
                Membership::Joined => (&c.channel, &c.user, true),
                Membership::Left => (&c.channel, &c.user, false),
                Membership::Invited => return,
            },
        };

        let mut channels = self.channels.lock().await;
        let Some(members) = channels.get_mut(channel) else {
            return;
        };
        let changed = if joined {
            members.insert(user.clone())
        } else {
            members.remove(user)
        };
        if changed {
            debug!(channel = %channel, user = %user, joined, "roster updated");
        }
    }

    pub async fn members(&self, channel: &ChannelRef) -> Option<Vec<UserId>> {
        let channels = self.channels.lock().await;
        channels
            .get(channel)
            .map(|members| members.iter().cloned().collect())
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StdioGateway {
    out: Mutex<Writer>,
    /// Server part used for channel ids this gateway mints.
    server: String,
    roster: Arc<Roster>,
    /// One entry per vetting session, like the session store itself.
    channels: Mutex<HashMap<SessionId, ChannelRef>>,
    next_id: AtomicU64,
}

impl StdioGateway {
    /// Gateway writing actions to the process stdout.
    pub fn stdout(server: impl Into<String>, roster: Arc<Roster>) -> Self {
        Self::with_writer(Box::new(tokio::io::stdout()), server, roster)
    }

    pub fn with_writer(out: Writer, server: impl Into<String>, roster: Arc<Roster>) -> Self {
        Self {
            out: Mutex::new(out),
            server: server.into(),
            roster,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn alloc_event_id(&self) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("$vetbot-{n}")
    }

    async fn emit(&self, action: &Outbound<'_>) -> Result<()> {
        let mut line = serde_json::to_string(action)?;
        line.push('\n');
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::External(format!("stdout write failed: {e}")))?;
        out.flush()
            .await
            .map_err(|e| Error::External(format!("stdout flush failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl MessagingGateway for StdioGateway {
    fn capabilities(&self) -> GatewayCapabilities {
        GatewayCapabilities {
            supports_channel_creation: true,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    async fn send_message(&self, channel: &ChannelRef, content: &str) -> Result<MessageRef> {
        let event_id = self.alloc_event_id();
        self.emit(&Outbound::SendMessage {
            channel,
            event_id: event_id.clone(),
            content,
        })
        .await?;
        Ok(MessageRef {
            channel: channel.clone(),
            event_id,
        })
    }

    async fn invite_user(&self, channel: &ChannelRef, user: &UserId) -> Result<()> {
        self.emit(&Outbound::InviteUser { channel, user }).await
    }

    async fn channel_members(&self, channel: &ChannelRef) -> Result<Vec<UserId>> {
        self.roster
            .members(channel)
            .await
            .ok_or_else(|| Error::External(format!("channel {channel} is not watched")))
    }

    async fn create_or_resolve_channel(&self, req: &ChannelRequest) -> Result<ChannelRef> {
        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(&req.session) {
            debug!(session = %req.session, channel = %existing, "vetting channel resolved");
            return Ok(existing.clone());
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let channel = ChannelRef(format!("!vetting{n}:{}", self.server));
        self.emit(&Outbound::CreateChannel {
            channel: &channel,
            request: req,
        })
        .await?;
        channels.insert(req.session.clone(), channel.clone());
        Ok(channel)
    }

    async fn open_poll(&self, channel: &ChannelRef, poll: &PollSpec) -> Result<MessageRef> {
        let event_id = self.alloc_event_id();
        self.emit(&Outbound::OpenPoll {
            channel,
            event_id: event_id.clone(),
            poll,
        })
        .await?;
        Ok(MessageRef {
            channel: channel.clone(),
            event_id,
        })
    }

    async fn close_poll(&self, channel: &ChannelRef, key: &SessionId) -> Result<()> {
        self.emit(&Outbound::ClosePoll { channel, key }).await
    }

    async fn ack(&self, delivery: &DeliveryId) -> Result<()> {
        self.emit(&Outbound::Ack { delivery }).await
    }
}

/// Inbound line. `id` may be omitted; one is derived from the line number.
#[derive(Debug, Deserialize)]
struct InboundLine {
    #[serde(default)]
    id: Option<DeliveryId>,
    event: RawEvent,
}

/// Read deliveries from `reader` until EOF, feeding `roster` on the way.
///
/// The channel closes when the reader is exhausted, which ends the engine loop.
pub fn spawn_reader<R>(
    reader: R,
    capacity: usize,
    roster: Arc<Roster>,
) -> (mpsc::Receiver<Delivery>, JoinHandle<anyhow::Result<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await.context("read inbound line")? {
            line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let parsed = match serde_json::from_str::<InboundLine>(&line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(line = line_no, "invalid inbound line skipped: {e}");
                    continue;
                }
            };

            roster.observe(&parsed.event).await;
            let delivery = Delivery {
                id: parsed
                    .id
                    .unwrap_or_else(|| DeliveryId(format!("line-{line_no}"))),
                event: parsed.event,
            };
            if tx.send(delivery).await.is_err() {
                debug!("engine stopped reading deliveries");
                break;
            }
        }

        info!(lines = line_no, "inbound stream closed");
        Ok(())
    });
    (rx, handle)
}

/// Deliveries from the process stdin.
pub fn stdin_deliveries(
    capacity: usize,
    roster: Arc<Roster>,
) -> (mpsc::Receiver<Delivery>, JoinHandle<anyhow::Result<()>>) {
    spawn_reader(tokio::io::stdin(), capacity, roster)
}

use async_trait::async_trait;

use crate::{
    domain::{ChannelRef, DeliveryId, MessageRef, SessionId, UserId},
    messaging::types::{ChannelRequest, GatewayCapabilities, PollSpec},
    Result,
};

/// Messaging gateway port.
///
/// The engine only ever talks to the chat network through this trait, so a
/// Matrix, Telegram or test adapter can sit behind it unchanged.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    fn capabilities(&self) -> GatewayCapabilities;

    async fn send_message(&self, channel: &ChannelRef, content: &str) -> Result<MessageRef>;
    async fn invite_user(&self, channel: &ChannelRef, user: &UserId) -> Result<()>;

    /// Users currently joined to `channel`.
    async fn channel_members(&self, channel: &ChannelRef) -> Result<Vec<UserId>>;

    /// Create the vetting channel for a request, or return the existing one.
    async fn create_or_resolve_channel(&self, req: &ChannelRequest) -> Result<ChannelRef>;

    async fn open_poll(&self, channel: &ChannelRef, poll: &PollSpec) -> Result<MessageRef>;
    async fn close_poll(&self, channel: &ChannelRef, key: &SessionId) -> Result<()>;

    /// Mark an inbound delivery as processed.
    async fn ack(&self, delivery: &DeliveryId) -> Result<()>;
}

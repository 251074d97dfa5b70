use async_trait::async_trait;

use crate::entity::SignalMessage;

/// Outbound half of a signaling transport.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Delivers `message` to the remote peer known as `id`.
    async fn emit_to(&self, id: &str, message: SignalMessage) -> crate::Result<()>;
}

/// Inbound half: the transport calls into this for every event a remote peer sends.
#[async_trait]
pub trait SignalHandler: Send + Sync {
    /// `from` is the identity the transport bound the sender to.
    async fn handle(&self, from: &str, message: SignalMessage) -> crate::Result<()>;

    /// The transport for `id` went away.
    async fn disconnected(&self, id: &str);
}

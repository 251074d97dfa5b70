use async_trait::async_trait;

use crate::entity::SessionDescription;

/// The connection-establishment primitive a session drives through the handshake.
///
/// A connection is owned by exactly one session once attached, so implementations only need
/// to be safe for shared reads; the orchestrator never drives one connection from two
/// handshakes at once.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Generates a local offer and installs it as the local description.
    async fn create_offer(&self) -> crate::Result<SessionDescription>;

    /// Generates a local answer for the remote offer already applied.
    async fn create_answer(&self) -> crate::Result<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> crate::Result<()>;

    async fn close(&self) -> crate::Result<()>;
}

/// Produces a fresh connection bound to a named channel.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    async fn create(&self, channel: &str) -> crate::Result<Self::Connection>;
}

/// Pre-offer hook run against a freshly created connection, e.g. to add a data channel or
/// a track before the offer is generated.
#[async_trait]
pub trait Initializer<C: Connection>: Send + Sync {
    async fn init(&self, conn: &C) -> crate::Result<()>;
}

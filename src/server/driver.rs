use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{driver::Driver, entity::SignalMessage, error::SignalError};

/// Routes outbound signals to the websocket each peer identity joined on.
#[derive(Clone, Default)]
pub struct WsDriver {
    routes: Arc<DashMap<String, mpsc::Sender<String>>>,
}

impl WsDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `id` to a socket writer. Returns the writer it replaced, if any.
    pub(crate) fn bind(
        &self,
        id: &str,
        tx: mpsc::Sender<String>,
    ) -> Option<mpsc::Sender<String>> {
        debug!(id, "peer joined");
        self.routes.insert(id.to_string(), tx)
    }

    /// Drop the route for `id` if it still points at `tx`. A newer socket that joined under
    /// the same identity keeps its route.
    pub(crate) fn unbind(&self, id: &str, tx: &mpsc::Sender<String>) -> bool {
        self.routes
            .remove_if(id, |_, current| current.same_channel(tx))
            .is_some()
    }

    pub fn is_bound(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }
}

#[async_trait]
impl Driver for WsDriver {
    async fn emit_to(&self, id: &str, message: SignalMessage) -> crate::Result<()> {
        let frame = serde_json::to_string(&message)?;
        let tx = self
            .routes
            .get(id)
            .map(|route| route.value().clone())
            .ok_or_else(|| SignalError::PeerUnreachable(id.to_string()))?;
        trace!(id, name = message.name(), "emit");
        tx.send(frame)
            .await
            .map_err(|_| SignalError::PeerUnreachable(id.to_string()))
    }
}

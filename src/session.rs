use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::{sync::watch, time};
use tracing::{debug, trace};

use crate::connection::Connection;

/// One peer's in-flight or established connection.
pub struct Session<C> {
    id: String,
    channel: String,
    connection: C,
    /// Flips to `true` exactly once, when the remote answer has been applied.
    ready: watch::Sender<bool>,
}

impl<C: Connection> Session<C> {
    pub fn new(id: &str, channel: &str, connection: C) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            id: id.to_string(),
            channel: channel.to_string(),
            connection,
            ready,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Marks the handshake as answered. Returns `false` if it was already signaled.
    pub(crate) fn signal_ready(&self) -> bool {
        self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Waits until the answer for this session has been applied. Returns immediately if
    /// that already happened.
    pub async fn ready(&self) {
        let mut rx = self.ready.subscribe();
        // The sender lives as long as `self`, so the wait only ends on `true`.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Like [`Session::ready`] but gives up after `timeout`. Returns whether the session
    /// became ready.
    pub async fn ready_timeout(&self, timeout: Duration) -> bool {
        time::timeout(timeout, self.ready()).await.is_ok()
    }
}

/// Outcome of a create-if-absent registration.
pub enum Attach<C> {
    /// The connection was wrapped in a new session.
    Created(Arc<Session<C>>),
    /// A session already existed; the rejected connection is handed back untouched.
    Occupied(Arc<Session<C>>, C),
}

impl<C> Attach<C> {
    pub fn session(&self) -> &Arc<Session<C>> {
        match self {
            Attach::Created(session) | Attach::Occupied(session, _) => session,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Attach::Created(_))
    }
}

/// Store of live sessions keyed by peer identity. Implementations must make `attach` and
/// `create` atomic per identity: two racing callers never both create a session.
pub trait SessionRegistry<C: Connection>: Send + Sync + 'static {
    fn query(&self, id: &str) -> Option<Arc<Session<C>>>;

    fn attach(&self, id: &str, channel: &str, connection: C) -> Attach<C>;

    /// Registration on the outbound path. Same contract as `attach`.
    fn create(&self, id: &str, channel: &str, connection: C) -> Attach<C> {
        self.attach(id, channel, connection)
    }

    fn remove(&self, id: &str) -> Option<Arc<Session<C>>>;

    /// Removes the entry for `session.id()` only if it still is `session`.
    fn remove_session(&self, session: &Arc<Session<C>>) -> bool;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SessionTable<C> {
    sessions: DashMap<String, Arc<Session<C>>>,
}

impl<C> SessionTable<C> {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }
}

impl<C> Default for SessionTable<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connection> SessionRegistry<C> for SessionTable<C> {
    fn query(&self, id: &str) -> Option<Arc<Session<C>>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    fn attach(&self, id: &str, channel: &str, connection: C) -> Attach<C> {
        // The entry holds the shard lock until it is dropped, which closes the window
        // between the absence check and the insert.
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => {
                trace!(id, "session already registered");
                Attach::Occupied(entry.get().clone(), connection)
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(Session::new(id, channel, connection));
                entry.insert(session.clone());
                debug!(id, channel, "session registered");
                Attach::Created(session)
            }
        }
    }

    fn remove(&self, id: &str) -> Option<Arc<Session<C>>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    fn remove_session(&self, session: &Arc<Session<C>>) -> bool {
        self.sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

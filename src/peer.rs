use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace, warn};

use crate::{
    connection::{Connection, ConnectionFactory, Initializer},
    driver::{Driver, SignalHandler},
    entity::{Description, SessionDescription, SignalMessage},
    error::SignalError,
    session::{Attach, Session, SessionRegistry},
    Result,
};

/// Acknowledgment of a torn down session. `result` carries the error from closing its
/// connection, if any; the session is gone from the registry either way.
#[derive(Debug)]
pub struct CloseAck {
    pub id: String,
    pub result: Result<()>,
}

/// Drives the offer/answer handshake for every peer identity.
///
/// A peer is in one of four states, inferred rather than stored: absent (not in the
/// registry), pending (registered, readiness not fired), established (answer applied) and
/// closed (removed again).
pub struct Peer<F, R, D> {
    factory: F,
    sessions: R,
    driver: D,
}

async fn release<C: Connection>(id: &str, conn: &C) {
    if let Err(err) = conn.close().await {
        warn!(id, cause = ?err, "failed to release connection");
    }
}

impl<F, R, D> Peer<F, R, D>
where
    F: ConnectionFactory,
    R: SessionRegistry<F::Connection>,
    D: Driver,
{
    pub fn new(factory: F, sessions: R, driver: D) -> Self {
        Self {
            factory,
            sessions,
            driver,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn sessions(&self) -> &R {
        &self.sessions
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Opens an outbound session to `id` and sends it an OFFER.
    ///
    /// `initializers` run in order against the new connection before the offer is
    /// generated. Wait on [`Session::ready`] for the answer.
    pub async fn connect(
        &self,
        id: &str,
        channel: &str,
        initializers: &[&dyn Initializer<F::Connection>],
    ) -> Result<Arc<Session<F::Connection>>> {
        let conn = self
            .factory
            .create(channel)
            .await
            .map_err(|err| SignalError::creation(channel, err))?;

        for init in initializers {
            if let Err(err) = init.init(&conn).await {
                release(id, &conn).await;
                return Err(SignalError::InitializerFailed {
                    id: id.to_string(),
                    source: Box::new(err),
                });
            }
        }

        let offer = match conn.create_offer().await {
            Ok(offer) => offer,
            Err(err) => {
                release(id, &conn).await;
                return Err(SignalError::OfferGenerationFailed {
                    id: id.to_string(),
                    source: Box::new(err),
                });
            }
        };

        let session = match self.sessions.create(id, channel, conn) {
            Attach::Created(session) => session,
            Attach::Occupied(_, conn) => {
                release(id, &conn).await;
                return Err(SignalError::SessionExists(id.to_string()));
            }
        };

        let offer = Description::new(id, channel, offer);
        if let Err(err) = self.driver.emit_to(id, SignalMessage::Offer(offer)).await {
            self.discard(&session).await;
            return Err(err);
        }
        info!(id, channel, "offer sent");
        Ok(session)
    }

    /// Applies a remote offer and returns the answer to send back.
    pub async fn on_offer(&self, offer: &Description) -> Result<Description> {
        let id = offer.session.as_str();
        let (session, fresh) = match self.sessions.query(id) {
            Some(session) => (session, false),
            None => {
                let conn = self
                    .factory
                    .create(&offer.channel)
                    .await
                    .map_err(|err| SignalError::creation(&offer.channel, err))?;
                match self.sessions.attach(id, &offer.channel, conn) {
                    Attach::Created(session) => (session, true),
                    Attach::Occupied(session, conn) => {
                        trace!(id, "lost session race, dropping spare connection");
                        release(id, &conn).await;
                        (session, false)
                    }
                }
            }
        };

        let remote = SessionDescription::offer(offer.sdp.clone());
        if let Err(err) = session.connection().set_remote_description(remote).await {
            if fresh {
                self.discard(&session).await;
            }
            return Err(SignalError::RemoteDescriptionRejected {
                id: id.to_string(),
                source: Box::new(err),
            });
        }

        let answer = match session.connection().create_answer().await {
            Ok(answer) => answer,
            Err(err) => {
                if fresh {
                    self.discard(&session).await;
                }
                return Err(SignalError::AnswerGenerationFailed {
                    id: id.to_string(),
                    source: Box::new(err),
                });
            }
        };
        debug!(id, channel = %offer.channel, "answer created");
        Ok(Description::new(id, &offer.channel, answer))
    }

    /// Applies a remote answer and releases readiness waiters. Answers for unknown sessions
    /// are ignored.
    pub async fn on_answer(&self, answer: &Description) -> Result<()> {
        let id = answer.session.as_str();
        let Some(session) = self.sessions.query(id) else {
            debug!(id, "answer for unknown session ignored");
            return Ok(());
        };

        let remote = SessionDescription::answer(answer.sdp.clone());
        session
            .connection()
            .set_remote_description(remote)
            .await
            .map_err(|err| SignalError::RemoteDescriptionRejected {
                id: id.to_string(),
                source: Box::new(err),
            })?;

        if session.signal_ready() {
            info!(id, "session established");
        } else {
            debug!(id, "session was already established");
        }
        Ok(())
    }

    /// Tears down the session for `id`. Returns `None` when there was nothing to close.
    pub async fn on_close(&self, id: &str) -> Option<CloseAck> {
        let session = self.sessions.remove(id)?;
        let result = session
            .connection()
            .close()
            .await
            .map_err(|err| SignalError::CloseFailed {
                id: id.to_string(),
                source: Box::new(err),
            });
        info!(id, "session closed");
        Some(CloseAck {
            id: id.to_string(),
            result,
        })
    }

    /// Local teardown: closes the session and tells the remote side.
    pub async fn close(&self, id: &str) -> Result<()> {
        let Some(ack) = self.on_close(id).await else {
            return Ok(());
        };
        let emitted = self
            .driver
            .emit_to(id, SignalMessage::Close(ack.id))
            .await;
        ack.result?;
        emitted
    }

    /// Rolls back a session this orchestrator registered, unless it was already replaced.
    async fn discard(&self, session: &Arc<Session<F::Connection>>) {
        if self.sessions.remove_session(session) {
            release(session.id(), session.connection()).await;
        }
    }
}

#[async_trait]
impl<F, R, D> SignalHandler for Peer<F, R, D>
where
    F: ConnectionFactory,
    R: SessionRegistry<F::Connection>,
    D: Driver,
{
    async fn handle(&self, from: &str, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Offer(offer) => {
                let answer = self.on_offer(&offer).await?;
                self.driver
                    .emit_to(from, SignalMessage::Answer(answer))
                    .await
            }
            SignalMessage::Answer(answer) => self.on_answer(&answer).await,
            SignalMessage::Close(id) => match self.on_close(&id).await {
                Some(ack) => {
                    self.driver
                        .emit_to(from, SignalMessage::Close(ack.id))
                        .await?;
                    ack.result
                }
                None => Ok(()),
            },
            SignalMessage::Join(id) => {
                warn!(from, join = %id, "join reached the orchestrator, ignored");
                Ok(())
            }
        }
    }

    async fn disconnected(&self, id: &str) {
        if let Some(CloseAck {
            result: Err(err), ..
        }) = self.on_close(id).await
        {
            warn!(id, cause = ?err, "close after disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::Peer;
    use crate::{
        connection::{Connection, ConnectionFactory, Initializer},
        driver::{Driver, SignalHandler},
        entity::{Description, SdpType, SessionDescription, SignalMessage},
        error::SignalError,
        session::{SessionRegistry, SessionTable},
        Result,
    };

    /// Which steps of a fake connection fail.
    #[derive(Clone, Copy, Default)]
    struct Script {
        fail_create: bool,
        fail_offer: bool,
        fail_answer: bool,
        fail_remote: bool,
        fail_close: bool,
    }

    #[derive(Default)]
    struct ConnState {
        closed: AtomicBool,
        initialized: AtomicUsize,
        remote: Mutex<Vec<SessionDescription>>,
    }

    impl ConnState {
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn remote(&self) -> Vec<SessionDescription> {
            self.remote.lock().unwrap().clone()
        }
    }

    struct FakeConnection {
        channel: String,
        script: Script,
        state: Arc<ConnState>,
    }

    fn scripted_failure() -> SignalError {
        SignalError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "scripted"))
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn create_offer(&self) -> Result<SessionDescription> {
            if self.script.fail_offer {
                return Err(scripted_failure());
            }
            Ok(SessionDescription::offer(format!("v=0 offer {}", self.channel)))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            if self.script.fail_answer {
                return Err(scripted_failure());
            }
            Ok(SessionDescription::answer(format!("v=0 answer {}", self.channel)))
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
            if self.script.fail_remote {
                return Err(scripted_failure());
            }
            self.state.remote.lock().unwrap().push(desc);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.state.closed.store(true, Ordering::SeqCst);
            if self.script.fail_close {
                return Err(scripted_failure());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        script: Script,
        created: Mutex<Vec<Arc<ConnState>>>,
    }

    impl FakeFactory {
        fn created(&self) -> Vec<Arc<ConnState>> {
            self.created.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConnection;

        async fn create(&self, channel: &str) -> Result<FakeConnection> {
            if self.script.fail_create {
                return Err(scripted_failure());
            }
            let state = Arc::new(ConnState::default());
            self.created.lock().unwrap().push(state.clone());
            Ok(FakeConnection {
                channel: channel.to_string(),
                script: self.script,
                state,
            })
        }
    }

    #[derive(Default)]
    struct RecordingDriver {
        fail: bool,
        sent: Mutex<Vec<(String, SignalMessage)>>,
    }

    impl RecordingDriver {
        fn sent(&self) -> Vec<(String, SignalMessage)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        async fn emit_to(&self, id: &str, message: SignalMessage) -> Result<()> {
            if self.fail {
                return Err(SignalError::PeerUnreachable(id.to_string()));
            }
            self.sent.lock().unwrap().push((id.to_string(), message));
            Ok(())
        }
    }

    struct CountingInit(Arc<AtomicUsize>);

    #[async_trait]
    impl Initializer<FakeConnection> for CountingInit {
        async fn init(&self, conn: &FakeConnection) -> Result<()> {
            // Record the order this initializer ran in.
            let order = self.0.fetch_add(1, Ordering::SeqCst);
            conn.state.initialized.store(order + 1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingInit;

    #[async_trait]
    impl Initializer<FakeConnection> for FailingInit {
        async fn init(&self, _conn: &FakeConnection) -> Result<()> {
            Err(scripted_failure())
        }
    }

    type TestPeer = Peer<FakeFactory, SessionTable<FakeConnection>, RecordingDriver>;

    fn peer(script: Script) -> TestPeer {
        Peer::new(
            FakeFactory {
                script,
                ..Default::default()
            },
            SessionTable::new(),
            RecordingDriver::default(),
        )
    }

    fn remote_offer(id: &str) -> Description {
        Description::new(id, "chan1", SessionDescription::offer("v=0..."))
    }

    fn remote_answer(id: &str) -> Description {
        Description::new(id, "chan1", SessionDescription::answer("v=0..."))
    }

    #[tokio::test]
    async fn connect_registers_and_emits_offer() -> Result<()> {
        let peer = peer(Script::default());
        let session = peer.connect("peerA", "chan1", &[]).await?;
        assert_eq!(session.id(), "peerA");
        assert!(!session.is_ready());
        assert!(peer.sessions().query("peerA").is_some());

        let sent = peer.driver().sent();
        assert_eq!(sent.len(), 1);
        let (to, msg) = &sent[0];
        assert_eq!(to, "peerA");
        match msg {
            SignalMessage::Offer(desc) => {
                assert_eq!(desc.session, "peerA");
                assert_eq!(desc.channel, "chan1");
                assert_eq!(desc.sdp_type, SdpType::Offer);
                assert_eq!(desc.sdp, "v=0 offer chan1");
            }
            other => panic!("expected offer, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn connect_runs_initializers_before_offer() -> Result<()> {
        let peer = peer(Script::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let first = CountingInit(counter.clone());
        let second = CountingInit(counter.clone());
        peer.connect("peerA", "chan1", &[&first, &second]).await?;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        let created = peer.factory().created();
        assert_eq!(created[0].initialized.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn connect_failed_initializer_releases_connection() {
        let peer = peer(Script::default());
        let res = peer.connect("peerA", "chan1", &[&FailingInit]).await;
        assert!(matches!(res, Err(SignalError::InitializerFailed { .. })));
        assert!(peer.factory().created()[0].is_closed());
        assert!(peer.sessions().is_empty());
        assert!(peer.driver().sent().is_empty());
    }

    #[tokio::test]
    async fn connect_failed_offer_releases_connection() {
        let peer = peer(Script {
            fail_offer: true,
            ..Default::default()
        });
        let res = peer.connect("peerA", "chan1", &[]).await;
        assert!(matches!(res, Err(SignalError::OfferGenerationFailed { .. })));
        assert!(peer.factory().created()[0].is_closed());
        assert!(peer.sessions().is_empty());
        assert!(peer.driver().sent().is_empty());
    }

    #[tokio::test]
    async fn connect_surfaces_creation_failure() {
        let peer = peer(Script {
            fail_create: true,
            ..Default::default()
        });
        let res = peer.connect("peerA", "chan1", &[]).await;
        assert!(matches!(
            res,
            Err(SignalError::ConnectionCreationFailed { ref channel, .. }) if channel == "chan1"
        ));
        assert!(peer.sessions().is_empty());
    }

    #[tokio::test]
    async fn connect_refuses_second_session() -> Result<()> {
        let peer = peer(Script::default());
        let first = peer.connect("peerA", "chan1", &[]).await?;
        let res = peer.connect("peerA", "chan1", &[]).await;
        assert!(matches!(res, Err(SignalError::SessionExists(ref id)) if id == "peerA"));

        let created = peer.factory().created();
        assert!(!created[0].is_closed());
        assert!(created[1].is_closed());
        let current = peer.sessions().query("peerA").expect("session kept");
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(peer.driver().sent().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn connect_rolls_back_when_driver_fails() {
        let peer = Peer::new(
            FakeFactory::default(),
            SessionTable::new(),
            RecordingDriver {
                fail: true,
                ..Default::default()
            },
        );
        let res = peer.connect("peerA", "chan1", &[]).await;
        assert!(matches!(res, Err(SignalError::PeerUnreachable(_))));
        assert!(peer.sessions().is_empty());
        assert!(peer.factory().created()[0].is_closed());
    }

    #[tokio::test]
    async fn offer_creates_session_and_answers() -> Result<()> {
        let peer = peer(Script::default());
        let answer = peer.on_offer(&remote_offer("peerB")).await?;
        assert_eq!(answer.session, "peerB");
        assert_eq!(answer.channel, "chan1");
        assert_eq!(answer.sdp_type, SdpType::Answer);

        assert!(peer.sessions().query("peerB").is_some());
        let created = peer.factory().created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].remote(), vec![SessionDescription::offer("v=0...")]);
        Ok(())
    }

    #[tokio::test]
    async fn offer_reuses_existing_connection() -> Result<()> {
        let peer = peer(Script::default());
        peer.on_offer(&remote_offer("peerB")).await?;
        peer.on_offer(&remote_offer("peerB")).await?;

        let created = peer.factory().created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].remote().len(), 2);
        assert_eq!(peer.sessions().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn offer_creation_failure_registers_nothing() {
        let peer = peer(Script {
            fail_create: true,
            ..Default::default()
        });
        let res = peer.on_offer(&remote_offer("peerB")).await;
        assert!(matches!(res, Err(SignalError::ConnectionCreationFailed { .. })));
        assert!(peer.sessions().is_empty());
    }

    #[tokio::test]
    async fn rejected_offer_leaves_no_session() {
        let peer = peer(Script {
            fail_remote: true,
            ..Default::default()
        });
        let res = peer.on_offer(&remote_offer("peerB")).await;
        assert!(matches!(res, Err(SignalError::RemoteDescriptionRejected { .. })));
        assert!(peer.sessions().is_empty());
        assert!(peer.factory().created()[0].is_closed());
    }

    #[tokio::test]
    async fn failed_answer_leaves_no_session() {
        let peer = peer(Script {
            fail_answer: true,
            ..Default::default()
        });
        let res = peer.on_offer(&remote_offer("peerB")).await;
        assert!(matches!(res, Err(SignalError::AnswerGenerationFailed { .. })));
        assert!(peer.sessions().is_empty());
        assert!(peer.factory().created()[0].is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_offers_share_one_session() -> Result<()> {
        let peer = Arc::new(peer(Script::default()));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let peer = peer.clone();
                tokio::spawn(async move { peer.on_offer(&remote_offer("peerB")).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("offer task panicked")?;
        }

        assert_eq!(peer.sessions().len(), 1);
        let created = peer.factory().created();
        let closed = created.iter().filter(|c| c.is_closed()).count();
        assert_eq!(closed, created.len() - 1);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn connect_racing_offer_keeps_one_session() -> Result<()> {
        for _ in 0..32 {
            let peer = Arc::new(peer(Script::default()));
            let outbound = {
                let peer = peer.clone();
                tokio::spawn(async move { peer.connect("peerA", "chan1", &[]).await })
            };
            let inbound = {
                let peer = peer.clone();
                tokio::spawn(async move { peer.on_offer(&remote_offer("peerA")).await })
            };

            match outbound.await.expect("connect task panicked") {
                Ok(_) | Err(SignalError::SessionExists(_)) => {}
                Err(err) => return Err(err),
            }
            inbound.await.expect("offer task panicked")?;

            assert_eq!(peer.sessions().len(), 1);
            let created = peer.factory().created();
            let closed = created.iter().filter(|c| c.is_closed()).count();
            assert_eq!(closed, created.len() - 1);
        }
        Ok(())
    }

    #[tokio::test]
    async fn answer_for_unknown_session_is_ignored() -> Result<()> {
        let peer = peer(Script::default());
        peer.on_answer(&remote_answer("nobody")).await?;
        assert!(peer.sessions().is_empty());
        assert!(peer.factory().created().is_empty());
        assert!(peer.driver().sent().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn answer_releases_waiter_once() -> Result<()> {
        let peer = peer(Script::default());
        let session = peer.connect("peerB", "chan1", &[]).await?;
        let released = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let session = session.clone();
            let released = released.clone();
            tokio::spawn(async move {
                session.ready().await;
                released.fetch_add(1, Ordering::SeqCst);
            })
        };

        peer.on_answer(&remote_answer("peerB")).await?;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not released")
            .expect("waiter panicked");
        assert!(session.is_ready());

        // A duplicate answer is applied but never re-fires readiness.
        peer.on_answer(&remote_answer("peerB")).await?;
        assert!(!session.signal_ready());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(peer.factory().created()[0].remote().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn rejected_answer_keeps_waiting() {
        let peer = peer(Script {
            fail_remote: true,
            ..Default::default()
        });
        let session = peer.connect("peerB", "chan1", &[]).await.expect("connect");
        let res = peer.on_answer(&remote_answer("peerB")).await;
        assert!(matches!(res, Err(SignalError::RemoteDescriptionRejected { .. })));
        assert!(!session.is_ready());
    }

    #[tokio::test]
    async fn close_is_idempotent() -> Result<()> {
        let peer = peer(Script::default());
        peer.on_offer(&remote_offer("peerB")).await?;

        let ack = peer.on_close("peerB").await.expect("close ack");
        assert_eq!(ack.id, "peerB");
        assert!(ack.result.is_ok());
        assert!(peer.sessions().query("peerB").is_none());
        assert!(peer.factory().created()[0].is_closed());

        assert!(peer.on_close("peerB").await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn close_failure_still_removes_session() -> Result<()> {
        let peer = peer(Script {
            fail_close: true,
            ..Default::default()
        });
        peer.on_offer(&remote_offer("peerB")).await?;
        let ack = peer.on_close("peerB").await.expect("close ack");
        assert!(matches!(ack.result, Err(SignalError::CloseFailed { .. })));
        assert!(peer.sessions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn local_close_notifies_remote() -> Result<()> {
        let peer = peer(Script::default());
        peer.connect("peerA", "chan1", &[]).await?;
        peer.close("peerA").await?;
        peer.close("peerA").await?;

        let sent = peer.driver().sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], ("peerA".to_string(), SignalMessage::Close("peerA".into())));
        Ok(())
    }

    #[tokio::test]
    async fn handle_dispatches_driver_events() -> Result<()> {
        let peer = peer(Script::default());
        peer.handle("peerB", SignalMessage::Offer(remote_offer("peerB"))).await?;
        peer.handle("peerB", SignalMessage::Close("peerB".into())).await?;
        peer.handle("peerB", SignalMessage::Close("peerB".into())).await?;
        peer.handle("peerB", SignalMessage::Join("peerB".into())).await?;

        let sent = peer.driver().sent();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            (to, SignalMessage::Answer(desc)) => {
                assert_eq!(to, "peerB");
                assert_eq!(desc.session, "peerB");
            }
            other => panic!("expected answer, got {:?}", other),
        }
        assert_eq!(sent[1], ("peerB".to_string(), SignalMessage::Close("peerB".into())));
        assert!(peer.sessions().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn disconnect_tears_down_silently() -> Result<()> {
        let peer = peer(Script::default());
        peer.on_offer(&remote_offer("peerB")).await?;
        peer.disconnected("peerB").await;
        assert!(peer.sessions().is_empty());
        assert!(peer.factory().created()[0].is_closed());
        assert!(peer.driver().sent().is_empty());
        Ok(())
    }
}

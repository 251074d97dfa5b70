use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, Semaphore},
    time,
};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    connection::ConnectionFactory,
    driver::SignalHandler,
    entity::SignalMessage,
    error::SignalError,
    peer::Peer,
    session::SessionTable,
    shutdown::Shutdown,
};

pub use self::driver::WsDriver;

pub mod connection;
pub mod driver;

const MAX_CONNECTIONS: usize = 200;
/// Time a client gets to complete the websocket upgrade after the TCP accept.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    /// Dispatch target for every inbound signal.
    signal: Arc<dyn SignalHandler>,
    driver: WsDriver,

    /// Broadcasts a shutdown signal to all active connections.
    ///
    /// The initial `shutdown` trigger is provided by the `run` caller. The
    /// server is responsible for gracefully shutting down active connections.
    /// When a connection task is spawned, it is passed a broadcast receiver
    /// handle. When a graceful shutdown is initiated, a `()` value is sent via
    /// the broadcast::Sender. Each active connection receives it, reaches a
    /// safe terminal state, and completes the task.
    notify_shutdown: broadcast::Sender<()>,
    /// Used as part of the graceful shutdown process to wait for client
    /// connections to complete processing.
    ///
    /// Each handler holds a clone of `shutdown_complete_tx`; once all of them
    /// are dropped `shutdown_complete_rx.recv()` completes with `None`.
    shutdown_complete_rx: mpsc::Receiver<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    listener: TcpListener,
    limit_connections: Arc<Semaphore>,
}

impl Server {
    pub async fn run(&mut self) -> crate::Result<()> {
        info!("accepting inbound connections");

        loop {
            // The permit moves into the handler task and returns to the semaphore
            // when that task drops it. `acquire_owned` only fails once the
            // semaphore is closed, which never happens.
            let permit = match self.limit_connections.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            };
            // Accept a new socket. This will attempt to perform error handling.
            // The `accept` method internally attempts to recover errors, so an
            // error here is non-recoverable.
            let (socket, peer) = self.accept().await?;

            let driver = self.driver.clone();
            let signal = self.signal.clone();
            // Receive shutdown notifications.
            let mut shutdown = Shutdown::new(self.notify_shutdown.subscribe());
            // Notifies the receiver half once all clones are dropped.
            let shutdown_complete = self.shutdown_complete_tx.clone();

            // The upgrade handshake runs in the task so a client that never sends it
            // cannot stall the accept loop.
            tokio::spawn(async move {
                let upgrade = tokio::select! {
                    res = time::timeout(UPGRADE_TIMEOUT, accept_async(socket)) => res,
                    _ = shutdown.recv() => return,
                };
                let stream = match upgrade {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(err)) => {
                        warn!(%peer, cause = ?err, "websocket upgrade failed");
                        return;
                    }
                    Err(_) => {
                        warn!(%peer, "websocket upgrade timed out");
                        return;
                    }
                };
                trace!(%peer, "accept new ws conn");
                let (connection, outbound) = connection::Connection::new(stream, peer);
                let mut handler = Handler {
                    connection,
                    outbound,
                    identity: None,
                    driver,
                    signal,
                    shutdown,
                    _shutdown_complete: shutdown_complete,
                };
                // Process the connection. If an error is encountered, log it.
                if let Err(err) = handler.run().await {
                    error!(cause = ?err, "connection error");
                }
                handler.leave().await;
                drop(permit);
            });
        }
    }

    /// Accept an inbound connection.
    ///
    /// Errors are handled by backing off and retrying. An exponential backoff
    /// strategy is used. After the first failure, the task waits for 1 second.
    /// After the second failure, the task waits for 2 seconds. Each subsequent
    /// failure doubles the wait time. If accepting fails on the 6th try after
    /// waiting for 64 seconds, then this function returns with an error.
    async fn accept(&mut self) -> crate::Result<(TcpStream, SocketAddr)> {
        let mut backoff = 1;

        // Try to accept a few times
        loop {
            // Perform the accept operation. If a socket is successfully
            // accepted, return it. Otherwise, save the error.
            match self.listener.accept().await {
                Ok((socket, peer)) => return Ok((socket, peer)),

                Err(err) => {
                    if backoff > 64 {
                        // Accept has failed too many times. Return the error.
                        return Err(err.into());
                    }
                }
            }

            // Pause execution until the back off period elapses.
            time::sleep(Duration::from_secs(backoff)).await;

            // Double the back off
            backoff *= 2;
        }
    }
}

/// Serve the signaling protocol on `listener` until `shutdown` completes.
///
/// Every socket first sends `["JOIN", <id>]`; OFFER, ANSWER and CLOSE frames that follow
/// are dispatched to a [`Peer`] as coming from that identity.
pub async fn run<F>(config: Config, listener: TcpListener, factory: F, shutdown: impl Future)
where
    F: ConnectionFactory,
{
    // When the provided `shutdown` future completes, we must send a shutdown
    // message to all active connections. We use a broadcast channel for this
    // purpose. The call below ignores the receiver of the broadcast pair, and when
    // a receiver is needed, the subscribe() method on the sender is used to create
    // one.
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    let max_conn_limit = config.max_connection_limit.unwrap_or(MAX_CONNECTIONS);
    let driver = WsDriver::new();
    let peer = Peer::new(factory, SessionTable::<F::Connection>::new(), driver.clone());
    let mut server = Server {
        signal: Arc::new(peer),
        driver,
        listener,
        notify_shutdown,
        shutdown_complete_tx,
        shutdown_complete_rx,
        limit_connections: Arc::new(Semaphore::new(max_conn_limit)),
    };

    tokio::select! {
        res = server.run() => {
            // If an error is received here, accepting connections from the TCP
            // listener failed multiple times and the server is giving up and
            // shutting down.
            //
            // Errors encountered when handling individual connections do not
            // bubble up to this point.
            if let Err(err) = res {
                error!(cause = %err, "failed to accept");
            }
        }
        _ = shutdown => {
            // The shutdown signal has been received.
            info!("shutting down");
        }
    }
    // Extract the `shutdown_complete` receiver and transmitter
    // explicitly drop `shutdown_transmitter`. This is important, as the
    // `.await` below would otherwise never complete.
    let Server {
        mut shutdown_complete_rx,
        shutdown_complete_tx,
        notify_shutdown,
        ..
    } = server;

    // When `notify_shutdown` is dropped, all tasks which have `subscribe`d will
    // receive the shutdown signal and can exit
    drop(notify_shutdown);
    // Drop final `Sender` so the `Receiver` below can complete
    drop(shutdown_complete_tx);

    // Wait for all active connections to finish processing. As the `Sender`
    // handle held by the listener has been dropped above, the only remaining
    // `Sender` instances are held by connection handler tasks. When those drop,
    // the `mpsc` channel will close and `recv()` will return `None`.
    let _ = shutdown_complete_rx.recv().await;
}

/// Per-socket handler. Binds the socket to a peer identity, then forwards its signals.
struct Handler {
    /// Read half of the websocket, decoding `SignalMessage` frames.
    connection: connection::Connection,
    /// Feeds the socket's writer task; registered with the driver on JOIN.
    outbound: mpsc::Sender<String>,
    /// Identity bound by the last JOIN frame.
    identity: Option<String>,
    driver: WsDriver,
    signal: Arc<dyn SignalHandler>,
    /// Listen for shutdown notifications.
    ///
    /// A wrapper around the `broadcast::Receiver` paired with the sender in
    /// `Server`. The handler processes frames until the peer disconnects
    /// **or** a shutdown notification is received.
    shutdown: Shutdown,

    /// Not used directly. Dropped with the handler to signal completion.
    _shutdown_complete: mpsc::Sender<()>,
}

impl Handler {
    async fn run(&mut self) -> crate::Result<()> {
        // As long as the shutdown signal has not been received, try to read a
        // new frame.
        while !self.shutdown.is_shutdown() {
            // While reading a frame, also listen for the shutdown signal.
            let frame = tokio::select! {
                res = self.connection.read_frame() => res,
                _ = self.shutdown.recv() => {
                    // If a shutdown signal is received, return from `run`.
                    // This will result in the task terminating.
                    return Ok(());
                }
            };

            // `None` means the peer closed the socket.
            let msg = match frame {
                Ok(Some(msg)) => msg,
                Ok(None) => return Ok(()),
                Err(SignalError::SerdeError(err)) => {
                    warn!(peer = %self.connection.peer(), cause = %err, "malformed frame dropped");
                    continue;
                }
                Err(err) => return Err(err),
            };

            debug!(?msg);
            match msg {
                SignalMessage::Join(id) => self.join(id).await,
                msg => match &self.identity {
                    Some(id) => {
                        let name = msg.name();
                        let msg = msg.addressed_from(id);
                        if let Err(err) = self.signal.handle(id, msg).await {
                            error!(id = %id, name, cause = %err, "signal failed");
                        }
                    }
                    None => warn!(
                        peer = %self.connection.peer(),
                        name = msg.name(),
                        "signal before join dropped"
                    ),
                },
            }
        }
        Ok(())
    }

    /// Bind this socket to `id`. A different identity bound earlier is released and its
    /// session torn down, as if that socket had closed.
    async fn join(&mut self, id: String) {
        if let Some(previous) = self.identity.take() {
            if previous != id && self.driver.unbind(&previous, &self.outbound) {
                self.signal.disconnected(&previous).await;
            }
        }
        if let Some(replaced) = self.driver.bind(&id, self.outbound.clone()) {
            if !replaced.same_channel(&self.outbound) {
                warn!(id = %id, "identity rebound to a new socket");
            }
        }
        self.identity = Some(id);
    }

    /// Release the identity bound to this socket and tear down its session.
    async fn leave(&mut self) {
        if let Some(id) = self.identity.take() {
            if self.driver.unbind(&id, &self.outbound) {
                self.signal.disconnected(&id).await;
            }
        }
    }
}

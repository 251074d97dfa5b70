use std::net::SocketAddr;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::{trace, warn};

use crate::entity::SignalMessage;
use crate::error::SignalError;
use crate::Result;

/// Frames queued per socket before emitters start waiting.
const OUTBOUND_BUFFER: usize = 32;

/// Read `SignalMessage` frames from a remote peer.
///
/// The write half lives in its own task fed by an mpsc channel, so any number of
/// emitters can address the socket without sharing the sink.
#[derive(Debug)]
pub struct Connection {
    peer: SocketAddr,
    stream: SplitStream<WebSocketStream<TcpStream>>,
}

impl Connection {
    /// Split `stream` and spawn its writer. Returns the read side and the sender feeding
    /// the writer; the writer exits once every sender is dropped.
    pub fn new(
        stream: WebSocketStream<TcpStream>,
        peer: SocketAddr,
    ) -> (Connection, mpsc::Sender<String>) {
        let (sink, stream) = stream.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        tokio::spawn(write_frames(sink, rx, peer));
        (Connection { peer, stream }, tx)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Read a single `SignalMessage` from the underlying stream.
    ///
    /// Control frames are skipped. Returns `None` once the peer closed the socket.
    pub async fn read_frame(&mut self) -> Result<Option<SignalMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(txt))) => return Ok(Some(serde_json::from_str(&txt)?)),
                Some(Ok(Message::Binary(buf))) => return Ok(Some(serde_json::from_slice(&buf)?)),
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(SignalError::WsError(err)),
            }
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<String>,
    peer: SocketAddr,
) {
    while let Some(frame) = rx.recv().await {
        trace!(%peer, "write frame: {}", &frame);
        if let Err(err) = sink.send(Message::Text(frame)).await {
            warn!(%peer, cause = ?err, "failed to write frame");
            return;
        }
    }
    let _ = sink.close().await;
}

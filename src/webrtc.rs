use async_trait::async_trait;
use tracing::{debug, info};
use ::webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder, API,
    },
    ice_transport::ice_server::RTCIceServer,
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::{sdp_type::RTCSdpType, session_description::RTCSessionDescription},
        RTCPeerConnection,
    },
};

use crate::{
    connection::{Connection, ConnectionFactory, Initializer},
    entity::{SdpType, SessionDescription},
    error::SignalError,
};

impl TryFrom<RTCSessionDescription> for SessionDescription {
    type Error = SignalError;

    fn try_from(desc: RTCSessionDescription) -> crate::Result<Self> {
        let sdp_type = match desc.sdp_type {
            RTCSdpType::Offer => SdpType::Offer,
            RTCSdpType::Answer => SdpType::Answer,
            other => return Err(SignalError::UnsupportedSdpType(other.to_string())),
        };
        Ok(SessionDescription {
            sdp_type,
            sdp: desc.sdp,
        })
    }
}

impl TryFrom<SessionDescription> for RTCSessionDescription {
    type Error = SignalError;

    fn try_from(desc: SessionDescription) -> crate::Result<Self> {
        let desc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        };
        Ok(desc)
    }
}

pub struct RtcConnection {
    channel: String,
    conn: RTCPeerConnection,
}

impl RtcConnection {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn peer_connection(&self) -> &RTCPeerConnection {
        &self.conn
    }

    /// Installs `local` and waits for ICE gathering to finish, so the returned description
    /// carries every candidate. Candidates are not trickled over the signaling channel.
    async fn install_local(
        &self,
        local: RTCSessionDescription,
    ) -> crate::Result<SessionDescription> {
        let mut gathered = self.conn.gathering_complete_promise().await;
        self.conn.set_local_description(local.clone()).await?;
        let _ = gathered.recv().await;
        debug!(channel = %self.channel, "ice gathering complete");
        match self.conn.local_description().await {
            Some(desc) => desc.try_into(),
            None => local.try_into(),
        }
    }
}

#[async_trait]
impl Connection for RtcConnection {
    async fn create_offer(&self) -> crate::Result<SessionDescription> {
        let offer = self.conn.create_offer(None).await?;
        self.install_local(offer).await
    }

    async fn create_answer(&self) -> crate::Result<SessionDescription> {
        let answer = self.conn.create_answer(None).await?;
        self.install_local(answer).await
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> crate::Result<()> {
        self.conn.set_remote_description(desc.try_into()?).await?;
        Ok(())
    }

    async fn close(&self) -> crate::Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

pub struct RtcConnectionFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl RtcConnectionFactory {
    pub fn new(ice_servers: Vec<String>) -> crate::Result<Self> {
        // Create a MediaEngine object to configure the supported codec
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();

        // Use the default set of Interceptors
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl ConnectionFactory for RtcConnectionFactory {
    type Connection = RtcConnection;

    async fn create(&self, channel: &str) -> crate::Result<RtcConnection> {
        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        let peer_connection = self.api.new_peer_connection(config).await?;
        let label = channel.to_string();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                info!(channel = %label, "peer connection state: {}", state);
                Box::pin(async {})
            },
        ));

        Ok(RtcConnection {
            channel: channel.to_string(),
            conn: peer_connection,
        })
    }
}

/// Opens a negotiated data channel before the offer is generated, so the offer carries an
/// application m-line.
pub struct DataChannelInit {
    pub label: String,
}

impl DataChannelInit {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl Initializer<RtcConnection> for DataChannelInit {
    async fn init(&self, conn: &RtcConnection) -> crate::Result<()> {
        let dc = conn.conn.create_data_channel(&self.label, None).await?;
        let label = self.label.clone();
        dc.on_open(Box::new(move || {
            info!("data channel open: {}", label);
            Box::pin(async {})
        }));
        Ok(())
    }
}

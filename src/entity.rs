use serde::{
    de::{self, Visitor},
    ser::SerializeSeq,
    Deserialize, Serialize,
};

pub const JOIN: &str = "JOIN";
pub const OFFER: &str = "OFFER";
pub const ANSWER: &str = "ANSWER";
pub const CLOSE: &str = "CLOSE";

#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A local or remote session description as produced and consumed by a connection.
#[derive(PartialEq, Eq, Debug, Clone)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Wire record exchanged through the driver.
///
/// `session` is the peer identity the description belongs to and `channel` the name the
/// connection was created for.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
pub struct Description {
    pub session: String,
    pub channel: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
}

impl Description {
    pub fn new(session: &str, channel: &str, desc: SessionDescription) -> Self {
        Self {
            session: session.to_string(),
            channel: channel.to_string(),
            sdp: desc.sdp,
            sdp_type: desc.sdp_type,
        }
    }

    pub fn session_description(&self) -> SessionDescription {
        SessionDescription {
            sdp_type: self.sdp_type,
            sdp: self.sdp.clone(),
        }
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum SignalMessage {
    /// Binds the sending socket to a peer identity.
    Join(String),
    Offer(Description),
    Answer(Description),
    Close(String),
}

impl SignalMessage {
    pub fn name(&self) -> &'static str {
        match self {
            SignalMessage::Join(_) => JOIN,
            SignalMessage::Offer(_) => OFFER,
            SignalMessage::Answer(_) => ANSWER,
            SignalMessage::Close(_) => CLOSE,
        }
    }

    /// Rewrites the peer identity carried by an inbound message to the identity the
    /// transport authenticated it as.
    pub fn addressed_from(self, id: &str) -> Self {
        match self {
            SignalMessage::Offer(mut desc) => {
                desc.session = id.to_string();
                SignalMessage::Offer(desc)
            }
            SignalMessage::Answer(mut desc) => {
                desc.session = id.to_string();
                SignalMessage::Answer(desc)
            }
            SignalMessage::Close(_) => SignalMessage::Close(id.to_string()),
            join => join,
        }
    }
}

impl Serialize for SignalMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(2))?;
        seq.serialize_element(self.name())?;
        match self {
            SignalMessage::Join(id) | SignalMessage::Close(id) => seq.serialize_element(id)?,
            SignalMessage::Offer(desc) | SignalMessage::Answer(desc) => {
                seq.serialize_element(desc)?
            }
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for SignalMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct MsgVisitor;
        impl<'de> Visitor<'de> for MsgVisitor {
            type Value = SignalMessage;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("Signal message")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let kind: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                match kind.as_str() {
                    JOIN | CLOSE => {
                        let id: String = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        if kind == JOIN {
                            Ok(SignalMessage::Join(id))
                        } else {
                            Ok(SignalMessage::Close(id))
                        }
                    }
                    OFFER => {
                        let desc = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(SignalMessage::Offer(desc))
                    }
                    ANSWER => {
                        let desc = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                        Ok(SignalMessage::Answer(desc))
                    }
                    _ => Err(de::Error::invalid_value(
                        de::Unexpected::Str(&kind),
                        &"Unknown signal type",
                    )),
                }
            }
        }
        deserializer.deserialize_seq(MsgVisitor)
    }
}

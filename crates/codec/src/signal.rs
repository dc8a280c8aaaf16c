use serde::{Deserialize, Serialize, Serializer};

use crate::Error;

/// The four message kinds of the negotiation.
///
/// On the wire the kind is encoded as its integer value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Offer = 0,
    Answer = 1,
    Decline = 2,
    IceCandidate = 3,
}

impl TryFrom<u64> for MessageType {
    type Error = Error;

    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::MessageType;
    ///
    /// assert_eq!(MessageType::try_from(0).unwrap(), MessageType::Offer);
    /// assert_eq!(MessageType::try_from(3).unwrap(), MessageType::IceCandidate);
    /// assert!(MessageType::try_from(4).is_err());
    /// ```
    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Offer,
            1 => Self::Answer,
            2 => Self::Decline,
            3 => Self::IceCandidate,
            _ => return Err(Error::UnknownType(value)),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Offer => "Offer",
            Self::Answer => "Answer",
            Self::Decline => "Decline",
            Self::IceCandidate => "IceCandidate",
        })
    }
}

/// A message exchanged through the relay.
///
/// `data` is opaque to the relay. It holds a json encoded
/// [`SessionDescription`](crate::SessionDescription) for offers and
/// answers, a json encoded [`IceCandidate`](crate::IceCandidate) for
/// candidates and a human readable reason for declines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub from: String,
    pub to: String,
    pub data: String,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: u64,
    from: String,
    to: String,
    data: String,
}

impl SignalMessage {
    pub fn new(kind: MessageType, from: &str, to: &str, data: String) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            data,
        }
    }

    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::{MessageType, SignalMessage};
    ///
    /// let message = SignalMessage::new(MessageType::Decline, "host", "client", "busy".to_string());
    /// assert_eq!(
    ///     message.encode().unwrap(),
    ///     r#"{"type":2,"from":"host","to":"client","data":"busy"}"#
    /// );
    /// ```
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a relay message.
    ///
    /// An unknown `type` value is reported as [`Error::UnknownType`] so the
    /// receiver can drop it without treating the connection as broken.
    ///
    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::{Error, MessageType, SignalMessage};
    ///
    /// let message = SignalMessage::decode(r#"{"type":0,"from":"client","to":"host","data":"{}"}"#).unwrap();
    /// assert_eq!(message.kind, MessageType::Offer);
    /// assert_eq!(message.from, "client");
    ///
    /// let unknown = SignalMessage::decode(r#"{"type":9,"from":"client","to":"host","data":""}"#);
    /// assert!(matches!(unknown, Err(Error::UnknownType(9))));
    /// ```
    pub fn decode(raw: &str) -> Result<Self, Error> {
        let WireMessage {
            kind,
            from,
            to,
            data,
        } = serde_json::from_str(raw)?;

        Ok(Self {
            kind: MessageType::try_from(kind)?,
            from,
            to,
            data,
        })
    }
}

use serde::{Deserialize, Serialize};

use crate::{Error, MessageType};

/// A message sent over an overlay network.
///
/// The overlay addresses peers on its own, so unlike
/// [`SignalMessage`](crate::SignalMessage) the frame has no `from` and
/// `to`: the sender is whoever the overlay says the frame came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlayFrame {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub data: String,
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: u64,
    data: String,
}

impl OverlayFrame {
    pub fn new(kind: MessageType, data: String) -> Self {
        Self { kind, data }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::{MessageType, OverlayFrame};
    ///
    /// let frame = OverlayFrame::new(MessageType::Answer, "{}".to_string());
    /// let bytes = frame.encode().unwrap();
    ///
    /// assert_eq!(bytes, br#"{"type":1,"data":"{}"}"#);
    /// assert_eq!(OverlayFrame::decode(&bytes).unwrap(), frame);
    /// ```
    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let WireFrame { kind, data } = serde_json::from_slice(bytes)?;
        Ok(Self {
            kind: MessageType::try_from(kind)?,
            data,
        })
    }
}

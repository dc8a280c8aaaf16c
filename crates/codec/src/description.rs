use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description, one half of the offer/answer exchange.
///
/// Carried as json in the `data` field of offer and answer messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::{SdpType, SessionDescription};
    ///
    /// let description = SessionDescription::from_json(r#"{"type":"answer","sdp":"v=0"}"#).unwrap();
    /// assert_eq!(description.kind, SdpType::Answer);
    /// assert!(SessionDescription::from_json(r#"{"type":"pranswer","sdp":"v=0"}"#).is_err());
    /// ```
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A network path a peer may be reachable on.
///
/// Both sides gather several of these and trickle them to each other, so
/// losing one of them is not fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(self)?)
    }

    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::IceCandidate;
    ///
    /// let candidate = IceCandidate::from_json(
    ///     r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
    /// )
    /// .unwrap();
    ///
    /// assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
    /// assert_eq!(candidate.sdp_mline_index, Some(0));
    /// ```
    pub fn from_json(raw: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(raw)?)
    }
}

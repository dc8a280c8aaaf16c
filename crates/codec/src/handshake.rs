//! Relay connection establishment.
//!
//! A peer authenticates with two tokens carried as headers of the websocket
//! upgrade request, never inside a message body: a fixed protocol tag and
//! the identity the peer wants to be reachable under.

/// Header carrying the protocol tag.
pub const PROTOCOL_HEADER: &str = "user-agent";

/// Header carrying the identity of the connecting peer.
pub const IDENTITY_HEADER: &str = "login-id";

/// Protocol tag expected by default on both ends.
pub const DEFAULT_PROTOCOL_TAG: &str = "rtc-link";

/// Why the relay refused a connection.
///
/// Each reason closes the connection with its own close code, so the
/// caller can decide between retrying with another identity and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// The protocol tag does not match, the peer speaks another version.
    InvalidProtocolTag,
    /// The identity is missing or empty.
    InvalidIdentity,
    /// Another live connection already uses this identity.
    IdentityOccupied,
}

impl Rejection {
    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::Rejection;
    ///
    /// assert_eq!(Rejection::InvalidProtocolTag.code(), 4000);
    /// assert_eq!(Rejection::from_code(4002), Some(Rejection::IdentityOccupied));
    /// assert_eq!(Rejection::from_code(1000), None);
    /// ```
    pub fn code(&self) -> u16 {
        match self {
            Self::InvalidProtocolTag => 4000,
            Self::InvalidIdentity => 4001,
            Self::IdentityOccupied => 4002,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            4000 => Self::InvalidProtocolTag,
            4001 => Self::InvalidIdentity,
            4002 => Self::IdentityOccupied,
            _ => return None,
        })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidProtocolTag => "Invalid 'user-agent'",
            Self::InvalidIdentity => "Invalid 'login-id'",
            Self::IdentityOccupied => "Occupied 'login-id'",
        }
    }
}

impl std::error::Error for Rejection {}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}

/// The tokens presented by a peer when it connects to the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub protocol_tag: Option<String>,
    pub identity: Option<String>,
}

impl Credentials {
    /// Check the tokens that do not depend on relay state.
    ///
    /// Identity occupancy can only be decided by the routing table and is
    /// not checked here.
    ///
    /// # Test
    ///
    /// ```
    /// use rtc_link_codec::{Credentials, Rejection};
    ///
    /// let credentials = Credentials {
    ///     protocol_tag: Some("rtc-link".to_string()),
    ///     identity: Some("host".to_string()),
    /// };
    ///
    /// assert_eq!(credentials.validate("rtc-link"), Ok("host"));
    /// assert_eq!(credentials.validate("other"), Err(Rejection::InvalidProtocolTag));
    ///
    /// let anonymous = Credentials {
    ///     protocol_tag: Some("rtc-link".to_string()),
    ///     identity: Some(String::new()),
    /// };
    ///
    /// assert_eq!(anonymous.validate("rtc-link"), Err(Rejection::InvalidIdentity));
    /// ```
    pub fn validate(&self, protocol_tag: &str) -> Result<&str, Rejection> {
        if self.protocol_tag.as_deref() != Some(protocol_tag) {
            return Err(Rejection::InvalidProtocolTag);
        }

        match self.identity.as_deref() {
            Some(identity) if !identity.is_empty() => Ok(identity),
            _ => Err(Rejection::InvalidIdentity),
        }
    }
}

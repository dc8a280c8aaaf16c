//! The rtc-link signaling relay.
//!
//! Peers connect over WebSocket under an identity and exchange the
//! messages that set up their direct sessions. The relay forwards each
//! message to the connection registered under its `to` field and never
//! looks at the payload.

pub mod config;
pub mod router;
pub mod server;

use std::sync::Arc;

use self::{config::Config, server::Relay};

/// In order to let the integration test directly use the rtc-link crate and
/// start the relay, a function is opened to replace the main function to
/// directly start the server.
pub async fn start_server(config: Config) -> anyhow::Result<()> {
    Relay::bind(Arc::new(config)).await?.run().await;
    Ok(())
}

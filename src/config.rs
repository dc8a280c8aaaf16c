use std::{fs::read_to_string, net::SocketAddr, str::FromStr};

use anyhow::Result;
use clap::Parser;
use codec::handshake::DEFAULT_PROTOCOL_TAG;
use serde::Deserialize;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// relay listen
    ///
    /// The address and port the WebSocket relay is bound to. The binding
    /// address supports ipv4 and ipv6.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
    ///
    /// protocol tag
    ///
    /// Every peer has to present this value in the `user-agent` header of
    /// the upgrade request, peers of another protocol version are refused.
    ///
    #[serde(default = "Server::protocol_tag")]
    pub protocol_tag: String,
    ///
    /// max message size
    ///
    /// The maximum size of a message. Uses the WebSocket default (64 MiB)
    /// when not set.
    ///
    #[serde(default)]
    pub max_message_size: Option<usize>,
    ///
    /// max frame size
    ///
    /// The maximum size of a single message frame, not including the frame
    /// header. Uses the WebSocket default (16 MiB) when not set.
    ///
    #[serde(default)]
    pub max_frame_size: Option<usize>,
}

impl Server {
    fn listen() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 3000))
    }

    fn protocol_tag() -> String {
        DEFAULT_PROTOCOL_TAG.to_string()
    }

    pub fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        if self.max_message_size.is_some() {
            config.max_message_size = self.max_message_size;
        }

        if self.max_frame_size.is_some() {
            config.max_frame_size = self.max_frame_size;
        }

        config
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            protocol_tag: Self::protocol_tag(),
            listen: Self::listen(),
            max_message_size: None,
            max_frame_size: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value {
            "trace" => Self::Trace,
            "debug" => Self::Debug,
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: rtc-link --config /etc/rtc-link/config.json5
    ///
    #[arg(long, short)]
    config: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is
    /// read from the configuration file, otherwise the default
    /// configuration is used.
    ///
    pub fn load() -> Result<Self> {
        match Cli::parse().config {
            Some(path) => Self::parse(&read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    /// # Test
    ///
    /// ```
    /// use rtc_link::config::{Config, LogLevel};
    ///
    /// let config = Config::parse("{ log: { level: 'debug' } }").unwrap();
    /// assert_eq!(config.log.level, LogLevel::Debug);
    /// assert_eq!(config.server.listen.port(), 3000);
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(text)?)
    }
}

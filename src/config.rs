//! Server and client settings
//!
//! Defaults mirror what a bare `chat_relay` invocation uses.

use std::time::Duration;

use crate::error::RelayError;

pub const DEFAULT_SERVER_PORT: u16 = 4444;
pub const DEFAULT_SERVER_ADDRESS: &str = "localhost";
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_NICKNAME: &str = "Someone";
pub const DEFAULT_CONVERSATION_NAME: &str = "Conversation";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host the listener binds to
    pub bind_host: String,
    /// Listen port
    pub port: u16,
    /// Nickname for clients that register with a blank one
    pub default_nickname: String,
    /// Name for conversations requested with a blank one
    pub default_conversation_name: String,
    /// Log every TX/RX envelope at info level
    pub print_messages: bool,
    /// Bound on the wait for the client's handshake ACK (`None` waits forever)
    pub handshake_timeout: Option<Duration>,
    /// Longest a single write may stall before the peer is treated as gone
    pub send_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            default_nickname: DEFAULT_NICKNAME.to_string(),
            default_conversation_name: DEFAULT_CONVERSATION_NAME.to_string(),
            print_messages: true,
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
        }
    }
}

impl ServerConfig {
    /// Build a config from command-line arguments (program name excluded)
    ///
    /// The only recognised argument is an optional listen port.
    pub fn from_args<I>(mut args: I) -> Result<Self, RelayError>
    where
        I: Iterator<Item = String>,
    {
        let mut config = Self::default();
        if let Some(port) = args.next() {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| RelayError::InvalidPort(port.clone()))?;
        }
        Ok(config)
    }

    /// Address string for the TCP listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> impl Iterator<Item = String> {
        list.iter().map(|s| s.to_string()).collect::<Vec<_>>().into_iter()
    }

    #[test]
    fn test_default_port() {
        let config = ServerConfig::from_args(args(&[])).unwrap();
        assert_eq!(config.port, 4444);
        assert_eq!(config.bind_addr(), "0.0.0.0:4444");
        assert_eq!(config.send_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_port_argument() {
        let config = ServerConfig::from_args(args(&["5555"])).unwrap();
        assert_eq!(config.port, 5555);
    }

    #[test]
    fn test_bad_port_argument() {
        let err = ServerConfig::from_args(args(&["lots"])).unwrap_err();
        assert!(matches!(err, RelayError::InvalidPort(p) if p == "lots"));
    }
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// BitMEX network selector. Anything other than the two recognized values
/// fails fast, before any connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Realtime websocket endpoint for this network.
    pub fn url(&self) -> &'static str {
        match self {
            Network::Mainnet => "wss://www.bitmex.com/realtime",
            Network::Testnet => "wss://testnet.bitmex.com/realtime",
        }
    }
}

impl FromStr for Network {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            other => Err(SessionError::InvalidNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// API key for authenticated streams (order, position, ...).
    #[serde(default)]
    pub api_key: Option<String>,
    /// API secret for signing the handshake.
    #[serde(default)]
    pub api_secret: Option<String>,
    /// Periodically refresh a cancelAllAfter safety net on the exchange.
    #[serde(default)]
    pub dead_mans_switch: bool,
    /// Static key-schema overrides, by table name. An override takes
    /// priority over the keys declared on a partial message.
    #[serde(default)]
    pub table_keys: HashMap<String, Vec<String>>,
}

impl SessionConfig {
    pub fn with_credentials(mut self, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self.api_secret = Some(api_secret.into());
        self
    }

    pub fn with_dead_mans_switch(mut self) -> Self {
        self.dead_mans_switch = true;
        self
    }

    pub fn with_table_keys(mut self, table: impl Into<String>, keys: Vec<String>) -> Self {
        self.table_keys.insert(table.into(), keys);
        self
    }

    /// Both credentials present.
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_parse() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert!(matches!(
            "staging".parse::<Network>(),
            Err(SessionError::InvalidNetwork(n)) if n == "staging"
        ));
    }

    #[test]
    fn test_network_urls() {
        assert_eq!(Network::Mainnet.url(), "wss://www.bitmex.com/realtime");
        assert_eq!(Network::Testnet.url(), "wss://testnet.bitmex.com/realtime");
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::default()
            .with_credentials("key", "secret")
            .with_dead_mans_switch()
            .with_table_keys("trade", vec!["symbol".to_string(), "timestamp".to_string()]);

        assert!(config.has_credentials());
        assert!(config.dead_mans_switch);
        assert_eq!(config.table_keys["trade"].len(), 2);
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert!(!config.has_credentials());
        assert!(!config.dead_mans_switch);
        assert!(config.table_keys.is_empty());
    }
}

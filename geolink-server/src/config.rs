//! Gateway configuration
//!
//! Only the options the core consumes are modeled. The file format is JSON
//! (see `geolink-cli`); everything has a default so an empty config starts
//! a gateway with no listeners.

use std::net::SocketAddr;

use chrono::FixedOffset;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,

    /// Create directory records for unknown unique ids instead of dropping
    /// their messages.
    pub auto_register: bool,

    /// Queue size of the downstream position pipeline.
    pub pipeline_queue: usize,

    pub huabao: ProtocolConfig,
    pub tr900: ProtocolConfig,
    pub manpower: ProtocolConfig,
    pub owntracks: ProtocolConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: 600,
            auto_register: false,
            pipeline_queue: 1024,
            huabao: ProtocolConfig::default(),
            tr900: ProtocolConfig::default(),
            manpower: ProtocolConfig::default(),
            owntracks: ProtocolConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// TCP (or HTTP) listen address. No address, no listener.
    pub address: Option<SocketAddr>,

    /// Optional UDP listen address; one logical message per datagram.
    pub udp_address: Option<SocketAddr>,

    /// Selects the 0xE7 framing and alternative command layouts.
    pub alternative: bool,

    /// Default device timezone as a fixed offset, e.g. `+08:00`.
    pub timezone: Option<String>,

    /// Replace the device-reported fix time with the server time.
    pub ignore_fix_time: bool,
}

impl ProtocolConfig {
    pub fn timezone(&self) -> Option<FixedOffset> {
        let timezone = self.timezone.as_deref()?;
        match timezone.parse() {
            Ok(offset) => Some(offset),
            Err(_) => {
                tracing::warn!(timezone, "ignoring unparsable timezone offset");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_parses_a_minimal_config() {
        let config: GatewayConfig = serde_json::from_str(
            r#"{
                "autoRegister": true,
                "huabao": {"address": "0.0.0.0:5023", "timezone": "+08:00"}
            }"#,
        )
        .unwrap();

        assert!(config.auto_register);
        assert_eq!(config.idle_timeout, 600);
        assert_eq!(
            config.huabao.address,
            Some("0.0.0.0:5023".parse().unwrap())
        );
        assert_eq!(
            config.huabao.timezone(),
            Some(FixedOffset::east_opt(8 * 3600).unwrap())
        );
        assert_eq!(config.tr900.address, None);
    }
}

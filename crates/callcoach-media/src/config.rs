//! Media plane configuration.

use crate::parameters::{MediaKind, RtpCapabilities, RtpCodecCapability};
use serde::Deserialize;

/// Configuration for workers, routers, and transports.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaConfig {
    /// Lower bound of the RTC port range workers allocate from.
    #[serde(default = "default_rtc_min_port")]
    pub rtc_min_port: u16,

    /// Upper bound of the RTC port range.
    #[serde(default = "default_rtc_max_port")]
    pub rtc_max_port: u16,

    /// Address advertised in ICE candidates.
    #[serde(default = "default_announced_address")]
    pub announced_address: String,

    /// Codecs every router is created with.
    #[serde(default = "default_media_codecs")]
    pub media_codecs: Vec<RtpCodecCapability>,

    /// Worker pool size; `None` sizes the pool to the CPU count.
    #[serde(default)]
    pub num_workers: Option<usize>,
}

fn default_rtc_min_port() -> u16 {
    40000
}

fn default_rtc_max_port() -> u16 {
    41000
}

fn default_announced_address() -> String {
    "127.0.0.1".to_string()
}

fn default_media_codecs() -> Vec<RtpCodecCapability> {
    vec![RtpCodecCapability {
        kind: MediaKind::Audio,
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
    }]
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            rtc_min_port: default_rtc_min_port(),
            rtc_max_port: default_rtc_max_port(),
            announced_address: default_announced_address(),
            media_codecs: default_media_codecs(),
            num_workers: None,
        }
    }
}

impl MediaConfig {
    /// The capabilities routers created from this config advertise.
    pub fn router_rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.media_codecs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_routes_opus() {
        let config = MediaConfig::default();
        let caps = config.router_rtp_capabilities();
        assert_eq!(caps.codecs.len(), 1);
        assert_eq!(caps.codecs[0].mime_type, "audio/opus");
        assert_eq!(caps.codecs[0].clock_rate, 48000);
        assert_eq!(caps.codecs[0].channels, 2);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: MediaConfig = toml::from_str("announced_address = \"203.0.113.9\"")
            .expect("partial config should deserialize");
        assert_eq!(config.announced_address, "203.0.113.9");
        assert_eq!(config.rtc_min_port, 40000);
        assert!(config.num_workers.is_none());
    }
}

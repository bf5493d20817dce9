//! Configuration management for the RTP bridge plugin

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_RTP_RANGE_MIN: u16 = 10000;
pub const DEFAULT_RTP_RANGE_MAX: u16 = 60000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Interface address media sockets bind to; wildcard when unset.
    pub local_ip: Option<String>,
    /// Address advertised in generated session descriptions; defaults to
    /// `local_ip` when that is set.
    pub sdp_ip: Option<String>,
    #[serde(default)]
    pub rtp_port_range: PortRange,
    /// Whether lifecycle events are forwarded to the host's event handlers.
    #[serde(default = "default_events")]
    pub events: bool,
    /// DSCP value applied (shifted into IP_TOS) on audio RTP sockets.
    #[serde(default)]
    pub dscp_audio_rtp: u8,
    /// DSCP value applied (shifted into IP_TOS) on video RTP sockets.
    #[serde(default)]
    pub dscp_video_rtp: u8,
    /// Directory recordings are written to; the process working directory
    /// when unset.
    pub recordings_dir: Option<String>,
}

fn default_events() -> bool {
    true
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            local_ip: None,
            sdp_ip: None,
            rtp_port_range: PortRange::default(),
            events: true,
            dscp_audio_rtp: 0,
            dscp_video_rtp: 0,
            recordings_dir: None,
        }
    }
}

/// RTP/RTCP port range. Accepts either a `{ min = .., max = .. }` table or
/// the compact `"min-max"` string form in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_RTP_RANGE_MIN,
            max: DEFAULT_RTP_RANGE_MAX,
        }
    }
}

impl FromStr for PortRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (min, max) = s
            .rsplit_once('-')
            .ok_or_else(|| Error::config(format!("Invalid port range: {s}")))?;
        let min: u16 = min
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("Invalid RTP min port value: {min}")))?;
        let max: u16 = max
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("Invalid RTP max port value: {max}")))?;
        Ok(Self { min, max })
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Pair { min: u16, max: u16 },
        }
        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Repr::Pair { min, max } => Ok(PortRange { min, max }),
        }
    }
}

impl PortRange {
    /// Normalize the range the way the allocator expects it: even minimum,
    /// min/max swapped if reversed, zero max widened to the port space.
    pub fn normalized(mut self) -> Self {
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        if self.min % 2 == 1 {
            self.min += 1;
        }
        if self.min > self.max {
            std::mem::swap(&mut self.min, &mut self.max);
        }
        if self.max == 0 {
            self.max = u16::MAX;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Full,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl BridgeConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)?;
        let config: BridgeConfig = toml::from_str(&contents)
            .map_err(|e| Error::config(format!("Failed to parse config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Resolve the configured bind address. An unset or unresolvable
    /// `local_ip` falls back to wildcard binding; a wildcard address is
    /// treated the same as unset.
    pub fn resolved_local_ip(&self) -> Option<IpAddr> {
        let text = self.general.local_ip.as_deref()?;
        match text.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => None,
            Ok(ip) => Some(ip),
            Err(_) => {
                tracing::warn!(
                    "Error setting local IP address to {text}, falling back to detecting IP address..."
                );
                None
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let range = self.general.rtp_port_range.normalized();
        if range.min > range.max {
            return Err(Error::config("Invalid RTP port range"));
        }
        Ok(())
    }
}

/// Best-effort detection of a non-loopback local address, used when neither
/// `local_ip` nor `sdp_ip` is configured. The socket is never written to;
/// connecting a datagram socket just selects the outbound interface.
pub fn detect_local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("8.8.8.8", 53)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_from_str() {
        let range: PortRange = "20000-40000".parse().unwrap();
        assert_eq!(range, PortRange { min: 20000, max: 40000 });
        assert!("20000".parse::<PortRange>().is_err());
        assert!("low-high".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_port_range_normalized() {
        // Odd minimum is bumped to the next even port.
        let range = PortRange { min: 10001, max: 20000 }.normalized();
        assert_eq!(range.min, 10002);
        // Reversed bounds are swapped before the even fix-up.
        let range = PortRange { min: 30000, max: 10001 }.normalized();
        assert_eq!(range, PortRange { min: 10002, max: 30000 });
        // Unbounded maximum widens to the full port space.
        let range = PortRange { min: 10000, max: 0 }.normalized();
        assert_eq!(range.max, u16::MAX);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [general]
            local_ip = "192.0.2.10"
            rtp_port_range = "12000-13000"
            dscp_audio_rtp = 46

            [logging]
            level = "debug"
            format = "compact"
        "#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.general.local_ip.as_deref(), Some("192.0.2.10"));
        assert_eq!(config.general.rtp_port_range, PortRange { min: 12000, max: 13000 });
        assert_eq!(config.general.dscp_audio_rtp, 46);
        assert!(config.general.events);
    }

    #[test]
    fn test_unresolvable_local_ip_falls_back_to_wildcard() {
        let config = BridgeConfig {
            general: GeneralConfig {
                local_ip: Some("not-an-ip".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.resolved_local_ip().is_none());

        let config = BridgeConfig {
            general: GeneralConfig {
                local_ip: Some("0.0.0.0".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.resolved_local_ip().is_none());

        let config = BridgeConfig {
            general: GeneralConfig {
                local_ip: Some("192.0.2.10".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(
            config.resolved_local_ip(),
            Some("192.0.2.10".parse().unwrap())
        );
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default_config();
        assert_eq!(config.general.rtp_port_range, PortRange::default());
        assert!(config.general.local_ip.is_none());
    }
}

//! Peer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use biplex_core::{BodyCodec, Status};

/// Transport network selected by the peer.
///
/// `quic` and `kcp` are recognized for configuration compatibility but are
/// served by external drivers; dialing or listening on them through the
/// built-in dialer fails with an explanatory status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
    Unix,
    Quic,
    Kcp,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::Quic => "quic",
            Network::Kcp => "kcp",
        }
    }

    pub fn is_tcp(self) -> bool {
        matches!(self, Network::Tcp | Network::Tcp4 | Network::Tcp6)
    }
}

/// Peer configuration.
///
/// Durations of zero mean "unlimited" (or "disabled" for
/// `slow_comet_duration`). For the `unix` network, `listen_ip` holds the
/// socket path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Transport network.
    pub network: Network,
    /// Server bind address (or unix socket path).
    pub listen_ip: String,
    /// Server bind port.
    pub listen_port: u16,
    /// Client-side bind address.
    pub local_ip: String,
    /// Client-side bind port (0 = ephemeral).
    pub local_port: u16,
    /// Max lifetime of a session; 0 = unlimited.
    pub default_session_age: Duration,
    /// Default deadline of a CALL/PUSH handler; 0 = unlimited.
    pub default_context_age: Duration,
    /// Calls slower than this are logged; 0 = disabled.
    pub slow_comet_duration: Duration,
    /// Name of the default body codec, validated against the codec set.
    pub default_body_codec: String,
    /// Log message details at debug level.
    pub print_detail: bool,
    /// Record per-call timings.
    pub count_time: bool,
    /// Redial attempts after a failed dial or lost connection:
    /// -1 = infinite, 0 = none, n = n additional attempts.
    pub redial_times: i32,
    /// Sleep between redial attempts.
    pub redial_interval: Duration,
    /// Timeout of a single dial attempt; 0 = none.
    pub dial_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            listen_ip: "0.0.0.0".into(),
            listen_port: 0,
            local_ip: "0.0.0.0".into(),
            local_port: 0,
            default_session_age: Duration::ZERO,
            default_context_age: Duration::ZERO,
            slow_comet_duration: Duration::ZERO,
            default_body_codec: "json".into(),
            print_detail: false,
            count_time: false,
            redial_times: 0,
            redial_interval: Duration::from_millis(100),
            dial_timeout: Duration::ZERO,
        }
    }
}

impl PeerConfig {
    /// Validates and normalizes the configuration.
    pub fn check(&mut self) -> Result<(), Status> {
        BodyCodec::by_name(&self.default_body_codec)?;
        if self.listen_ip.is_empty() {
            self.listen_ip = "0.0.0.0".into();
        }
        if self.local_ip.is_empty() {
            self.local_ip = "0.0.0.0".into();
        }
        if self.network.is_tcp() {
            if let Err(e) = self.listen_ip.parse::<std::net::IpAddr>() {
                return Err(Status::new(
                    biplex_core::code::UNKNOWN_ERROR,
                    "invalid peer config",
                    format!("listen_ip {:?}: {e}", self.listen_ip),
                ));
            }
            if let Err(e) = self.local_ip.parse::<std::net::IpAddr>() {
                return Err(Status::new(
                    biplex_core::code::UNKNOWN_ERROR,
                    "invalid peer config",
                    format!("local_ip {:?}: {e}", self.local_ip),
                ));
            }
        }
        if self.redial_times < -1 {
            self.redial_times = -1;
        }
        Ok(())
    }

    /// The server bind address string.
    pub fn listen_addr(&self) -> String {
        if self.network.is_tcp() {
            format!("{}:{}", self.listen_ip, self.listen_port)
        } else {
            self.listen_ip.clone()
        }
    }

    /// The client bind address string.
    pub fn local_addr(&self) -> String {
        if self.network.is_tcp() {
            format!("{}:{}", self.local_ip, self.local_port)
        } else {
            String::new()
        }
    }

    /// `default_session_age` with zero mapped to `None`.
    pub(crate) fn session_age(&self) -> Option<Duration> {
        (!self.default_session_age.is_zero()).then_some(self.default_session_age)
    }

    /// `default_context_age` with zero mapped to `None`.
    pub(crate) fn context_age(&self) -> Option<Duration> {
        (!self.default_context_age.is_zero()).then_some(self.default_context_age)
    }

    pub(crate) fn slow_comet(&self) -> Option<Duration> {
        (!self.slow_comet_duration.is_zero()).then_some(self.slow_comet_duration)
    }

    pub(crate) fn dial_timeout_opt(&self) -> Option<Duration> {
        (!self.dial_timeout.is_zero()).then_some(self.dial_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_checks() {
        let mut cfg = PeerConfig::default();
        cfg.check().unwrap();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:0");
    }

    #[test]
    fn test_unknown_codec_rejected() {
        let mut cfg = PeerConfig {
            default_body_codec: "xml".into(),
            ..Default::default()
        };
        assert!(cfg.check().is_err());
    }

    #[test]
    fn test_bad_listen_ip_rejected() {
        let mut cfg = PeerConfig {
            listen_ip: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(cfg.check().is_err());
    }

    #[test]
    fn test_unix_path_allowed() {
        let mut cfg = PeerConfig {
            network: Network::Unix,
            listen_ip: "/tmp/biplex.sock".into(),
            ..Default::default()
        };
        cfg.check().unwrap();
        assert_eq!(cfg.listen_addr(), "/tmp/biplex.sock");
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let cfg = PeerConfig {
            listen_port: 9090,
            default_session_age: Duration::from_secs(7),
            redial_times: -1,
            ..Default::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PeerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.listen_port, 9090);
        assert_eq!(back.default_session_age, Duration::from_secs(7));
        assert_eq!(back.redial_times, -1);
    }
}

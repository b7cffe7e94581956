//! Dialer: establishes outbound connections with retry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;

use biplex_core::{Conn, Status};

use crate::config::{Network, PeerConfig};

/// Counts redial attempts: -1 = infinite, 0 = none, n = n attempts.
pub(crate) struct RedialCounter(i32);

impl RedialCounter {
    pub(crate) fn next(&mut self) -> bool {
        if self.0 == 0 {
            return false;
        }
        if self.0 > 0 {
            self.0 -= 1;
        }
        true
    }
}

/// Dial-up connector. One [`Dialer::dial_one`] call makes one attempt;
/// retry pacing belongs to the caller via [`Dialer::counter`] and
/// [`Dialer::redial_interval`].
#[derive(Debug, Clone)]
pub struct Dialer {
    network: Network,
    local_ip: String,
    local_port: u16,
    dial_timeout: Option<Duration>,
    redial_interval: Duration,
    redial_times: i32,
}

impl Dialer {
    pub(crate) fn from_config(cfg: &PeerConfig) -> Self {
        Self {
            network: cfg.network,
            local_ip: cfg.local_ip.clone(),
            local_port: cfg.local_port,
            dial_timeout: cfg.dial_timeout_opt(),
            redial_interval: cfg.redial_interval,
            redial_times: cfg.redial_times,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn redial_times(&self) -> i32 {
        self.redial_times
    }

    pub fn redial_interval(&self) -> Duration {
        self.redial_interval
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout
    }

    /// The configured client bind address.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub(crate) fn counter(&self) -> RedialCounter {
        RedialCounter(self.redial_times)
    }

    /// Makes one connection attempt and returns the stream with its
    /// local/remote address strings.
    pub async fn dial_one(
        &self,
        addr: &str,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<(Conn, String, String), Status> {
        match self.network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => self.dial_tcp(addr, tls).await,
            #[cfg(unix)]
            Network::Unix => self.dial_unix(addr).await,
            #[cfg(not(unix))]
            Network::Unix => Err(Status::dial_failed(
                "unix sockets are not supported on this platform",
            )),
            Network::Quic | Network::Kcp => Err(Status::dial_failed(format!(
                "network {:?} is served by an external transport driver",
                self.network
            ))),
        }
    }

    async fn dial_tcp(
        &self,
        addr: &str,
        tls: Option<Arc<ClientConfig>>,
    ) -> Result<(Conn, String, String), Status> {
        let target = self.resolve(addr).await?;
        let connect = async {
            let stream = if self.local_port != 0 {
                let socket = if target.is_ipv4() {
                    TcpSocket::new_v4()
                } else {
                    TcpSocket::new_v6()
                }
                .map_err(|e| Status::dial_failed(e.to_string()))?;
                let bind: SocketAddr = format!("{}:{}", self.local_ip, self.local_port)
                    .parse()
                    .map_err(|e| Status::dial_failed(format!("local bind address: {e}")))?;
                socket
                    .bind(bind)
                    .map_err(|e| Status::dial_failed(e.to_string()))?;
                socket
                    .connect(target)
                    .await
                    .map_err(|e| Status::dial_failed(e.to_string()))?
            } else {
                TcpStream::connect(target)
                    .await
                    .map_err(|e| Status::dial_failed(e.to_string()))?
            };
            Ok::<TcpStream, Status>(stream)
        };

        let stream = match self.dial_timeout {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|_| Status::dial_failed(format!("dial to {addr} timed out")))??,
            None => connect.await?,
        };

        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());

        match tls {
            None => Ok((Box::new(stream), local, remote)),
            Some(config) => {
                let domain = ServerName::try_from(host_of(addr).to_string())
                    .map_err(|e| Status::dial_failed(format!("TLS server name: {e}")))?;
                let tls_stream = TlsConnector::from(config)
                    .connect(domain, stream)
                    .await
                    .map_err(|e| Status::dial_failed(format!("TLS handshake: {e}")))?;
                Ok((Box::new(tls_stream), local, remote))
            }
        }
    }

    #[cfg(unix)]
    async fn dial_unix(&self, addr: &str) -> Result<(Conn, String, String), Status> {
        let connect = tokio::net::UnixStream::connect(addr);
        let stream = match self.dial_timeout {
            Some(t) => tokio::time::timeout(t, connect)
                .await
                .map_err(|_| Status::dial_failed(format!("dial to {addr} timed out")))?
                .map_err(|e| Status::dial_failed(e.to_string()))?,
            None => connect
                .await
                .map_err(|e| Status::dial_failed(e.to_string()))?,
        };
        let local = format!("unix:client->{addr}");
        Ok((Box::new(stream), local, addr.to_string()))
    }

    async fn resolve(&self, addr: &str) -> Result<SocketAddr, Status> {
        let mut addrs = lookup_host(addr)
            .await
            .map_err(|e| Status::dial_failed(format!("resolve {addr}: {e}")))?;
        let want_v4 = self.network == Network::Tcp4;
        let want_v6 = self.network == Network::Tcp6;
        addrs
            .find(|a| {
                if want_v4 {
                    a.is_ipv4()
                } else if want_v6 {
                    a.is_ipv6()
                } else {
                    true
                }
            })
            .ok_or_else(|| Status::dial_failed(format!("no usable address for {addr}")))
    }
}

/// The host part of `host:port`, unbracketing IPv6 literals.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redial_counter_semantics() {
        let mut none = RedialCounter(0);
        assert!(!none.next());

        let mut two = RedialCounter(2);
        assert!(two.next());
        assert!(two.next());
        assert!(!two.next());

        let mut infinite = RedialCounter(-1);
        for _ in 0..64 {
            assert!(infinite.next());
        }
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("127.0.0.1:9090"), "127.0.0.1");
        assert_eq!(host_of("example.com:443"), "example.com");
        assert_eq!(host_of("[::1]:80"), "::1");
    }

    #[tokio::test]
    async fn test_dial_refused_fails() {
        let cfg = PeerConfig::default();
        let dialer = Dialer::from_config(&cfg);
        // Port 1 on localhost is essentially never listening.
        let err = dialer.dial_one("127.0.0.1:1", None).await.err().unwrap();
        assert_eq!(err.code(), biplex_core::code::DIAL_FAILED);
    }

    #[tokio::test]
    async fn test_quic_needs_external_driver() {
        let cfg = PeerConfig {
            network: Network::Quic,
            ..Default::default()
        };
        let dialer = Dialer::from_config(&cfg);
        let err = dialer.dial_one("127.0.0.1:9090", None).await.err().unwrap();
        assert_eq!(err.code(), biplex_core::code::DIAL_FAILED);
        assert!(err.cause().contains("external transport driver"));
    }
}

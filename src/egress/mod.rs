//! Egress path: candidate pool, failover dialer, probing
//!
//! Outer code sees a single `dial(network, addr)` contract. Behind it the
//! dialer keeps an ordered list of egress candidates (HTTP/HTTPS CONNECT
//! proxies, SOCKS5 proxies, DIRECT), tracks their health under concurrent
//! load, fails over in-line when the preferred path breaks, probes broken
//! candidates in the background, and fails back to the highest-priority
//! candidate once a probe confirms its recovery.

pub mod candidate;
mod http;
mod monitor;
mod pool;
mod probe;
mod socks5;

pub use candidate::{parse_candidates, Candidate, CandidateKind, ProxyAuth};
pub use monitor::MonitoredStream;
pub use pool::{CandidateStatus, Pool, PoolStatus, FAIL_THRESHOLD};
pub use probe::{probe_url, ProbeConfig, ProbeEngine, DEFAULT_PROBE_URLS};
pub use socks5::Socks5UdpStream;

use crate::common::net::{configure_tcp_stream, split_host_port, Address};
use crate::common::DialError;
use crate::config::EgressConfig;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info};

/// Byte-stream object returned by dial operations
pub trait EgressStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> EgressStream for T {}

pub type BoxedStream = Box<dyn EgressStream>;

/// The generic dial capability handed to outer code
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, DialError>;
}

/// Per-attempt deadlines
#[derive(Debug, Clone, Copy)]
pub struct DialTimeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

fn network_is_tcp(network: &str) -> bool {
    matches!(network, "tcp" | "tcp4" | "tcp6")
}

/// Open a TCP tunnel to `host:port` through one candidate.
///
/// No pool state is touched here; the caller records the outcome. Any
/// partially opened socket is dropped (and thereby closed) on failure.
pub(crate) async fn attempt_via(
    candidate: &Candidate,
    host: &str,
    port: u16,
    t: &DialTimeouts,
) -> Result<BoxedStream, DialError> {
    match candidate.kind {
        CandidateKind::Direct => {
            let stream = timeout(t.connect, TcpStream::connect((host, port)))
                .await
                .map_err(|_| DialError::Timeout("connect"))??;
            configure_tcp_stream(&stream);
            Ok(Box::new(stream))
        }
        CandidateKind::Http => {
            let mut stream = timeout(t.connect, TcpStream::connect(candidate.server.as_str()))
                .await
                .map_err(|_| DialError::Timeout("connect"))??;
            configure_tcp_stream(&stream);
            http::establish(&mut stream, host, port, candidate.auth.as_ref(), t.read, t.write)
                .await?;
            Ok(Box::new(stream))
        }
        CandidateKind::Socks5 => {
            let mut stream = timeout(t.connect, TcpStream::connect(candidate.server.as_str()))
                .await
                .map_err(|_| DialError::Timeout("connect"))??;
            configure_tcp_stream(&stream);
            let target = Address::from(host);
            socks5::connect(&mut stream, &target, port, candidate.auth.as_ref(), t.read, t.write)
                .await?;
            Ok(Box::new(stream))
        }
    }
}

/// Multi-candidate failover dialer.
///
/// Each instance owns its pool; two dialers never share health state. The
/// probe task (when running) exits with the dialer.
pub struct EgressDialer {
    pool: Arc<RwLock<Pool>>,
    timeouts: DialTimeouts,
    shutdown: broadcast::Sender<()>,
}

impl EgressDialer {
    /// Build a dialer from configuration and start probing if the pool has
    /// anything to fail over to.
    pub fn new(config: &EgressConfig) -> Result<Self, DialError> {
        let candidates = parse_candidates(&config.dial, config.dial_fallback)?;
        if config.success_threshold == 0 {
            return Err(DialError::config("success_threshold must be at least 1"));
        }

        let pool = Arc::new(RwLock::new(Pool::new(candidates)));
        let (shutdown, _) = broadcast::channel(1);
        let timeouts = DialTimeouts {
            connect: config.connect_timeout(),
            read: config.read_timeout(),
            write: config.write_timeout(),
        };

        let dialer = EgressDialer {
            pool: pool.clone(),
            timeouts,
            shutdown: shutdown.clone(),
        };

        // A single candidate has no alternative to fail over to, so probing
        // it buys nothing.
        if pool.read().len() > 1 {
            let engine = ProbeEngine::new(
                pool,
                ProbeConfig {
                    urls: config.probe_urls.clone(),
                    interval: config.probe_interval(),
                    timeout: config.probe_timeout(),
                    success_threshold: config.success_threshold,
                    transfer_idle: config.transfer_idle(),
                },
                timeouts,
            );
            tokio::spawn(engine.run(shutdown.subscribe()));
        }

        Ok(dialer)
    }

    /// Dial `addr` over TCP through the current best candidate, walking the
    /// healthy candidates in priority order on failure.
    pub async fn dial(
        &self,
        network: &str,
        addr: &str,
    ) -> Result<MonitoredStream<BoxedStream>, DialError> {
        if !network_is_tcp(network) {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }
        let (host, port) =
            split_host_port(addr).map_err(|e| DialError::config(e.to_string()))?;

        let primary = {
            let pool = self.pool.read();
            let entry = pool.pick_primary();
            entry.candidate.clone()
        };

        let last_err = match attempt_via(&primary, &host, port, &self.timeouts).await {
            Ok(stream) => {
                self.pool.write().mark_dial_ok(primary.rank);
                return Ok(self.monitored(stream));
            }
            Err(e) => {
                debug!("dial {} via {} failed: {}", addr, primary.url, e);
                self.pool.write().mark_dial_err(primary.rank);
                e
            }
        };

        // Failover walk: remaining healthy candidates, best rank first, each
        // at most once.
        let alternates: Vec<Candidate> = {
            let pool = self.pool.read();
            pool.healthy_in_rank_order()
                .map(|entry| entry.candidate.clone())
                .filter(|c| c.rank != primary.rank)
                .collect()
        };

        let mut last_err = last_err;
        for candidate in alternates {
            match attempt_via(&candidate, &host, port, &self.timeouts).await {
                Ok(stream) => {
                    self.pool.write().mark_dial_ok(candidate.rank);
                    info!("switched from {} to {}", primary.url, candidate.url);
                    return Ok(self.monitored(stream));
                }
                Err(e) => {
                    debug!("dial {} via {} failed: {}", addr, candidate.url, e);
                    self.pool.write().mark_dial_err(candidate.rank);
                    last_err = e;
                }
            }
        }

        Err(DialError::AllCandidatesFailed {
            last: Box::new(last_err),
        })
    }

    /// Open a UDP relay to `addr` through the current candidate.
    ///
    /// Only a SOCKS5 primary can carry UDP; callers receiving
    /// `UdpUnsupportedByProxy` fall back to a locally bound socket.
    pub async fn dial_udp(
        &self,
        addr: &str,
    ) -> Result<MonitoredStream<Socks5UdpStream>, DialError> {
        let (host, port) =
            split_host_port(addr).map_err(|e| DialError::config(e.to_string()))?;

        let primary = {
            let pool = self.pool.read();
            pool.pick_primary().candidate.clone()
        };

        if primary.kind != CandidateKind::Socks5 {
            return Err(DialError::UdpUnsupportedByProxy);
        }

        let result = async {
            let control =
                timeout(self.timeouts.connect, TcpStream::connect(primary.server.as_str()))
                    .await
                    .map_err(|_| DialError::Timeout("connect"))??;
            configure_tcp_stream(&control);
            socks5::udp_associate(
                control,
                Address::from(host.as_str()),
                port,
                primary.auth.as_ref(),
                self.timeouts.read,
                self.timeouts.write,
            )
            .await
        }
        .await;

        match result {
            Ok(stream) => {
                self.pool.write().mark_dial_ok(primary.rank);
                Ok(MonitoredStream::new(stream, Arc::downgrade(&self.pool)))
            }
            Err(e) => {
                debug!("udp associate via {} failed: {}", primary.url, e);
                self.pool.write().mark_dial_err(primary.rank);
                Err(e)
            }
        }
    }

    fn monitored(&self, stream: BoxedStream) -> MonitoredStream<BoxedStream> {
        MonitoredStream::new(stream, Arc::downgrade(&self.pool))
    }

    /// Per-candidate health and global counters for diagnostics
    pub fn status(&self) -> PoolStatus {
        self.pool.read().status()
    }

    /// Stop the probe task and release the pool
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

impl Drop for EgressDialer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

#[async_trait]
impl Dialer for EgressDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, DialError> {
        let stream = EgressDialer::dial(self, network, addr).await?;
        Ok(Box::new(stream))
    }
}

/// Plain OS-socket dialer used when no egress list is configured
pub struct SystemDialer {
    connect_timeout: Duration,
}

impl SystemDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        SystemDialer { connect_timeout }
    }
}

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, network: &str, addr: &str) -> Result<BoxedStream, DialError> {
        if !network_is_tcp(network) {
            return Err(DialError::UnsupportedNetwork(network.to_string()));
        }
        let (host, port) =
            split_host_port(addr).map_err(|e| DialError::config(e.to_string()))?;
        let stream = timeout(self.connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| DialError::Timeout("connect"))??;
        configure_tcp_stream(&stream);
        Ok(Box::new(stream))
    }
}

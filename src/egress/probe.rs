//! Out-of-band liveness probing
//!
//! A single background task wakes every probe interval and re-tests
//! candidates that are currently down. A candidate passes when enough of the
//! configured probe URLs respond through it. Sweeps are suppressed entirely
//! while user traffic is flowing; live transfers are better evidence than
//! any probe.
//!
//! Probes through HTTPS URLs perform a TLS handshake with certificate
//! verification disabled: the question is whether the path moves bytes, not
//! whether the endpoint's certificate chain is valid.

use super::candidate::{Candidate, CandidateKind};
use super::pool::{Pool, PromoteOutcome};
use super::{attempt_via, DialTimeouts};
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};
use url::Url;

/// Default probe endpoints: well-known captive-portal / generate-204 URLs
pub const DEFAULT_PROBE_URLS: &[&str] = &[
    "https://cp.cloudflare.com/",
    "https://connectivitycheck.gstatic.com/generate_204",
    "http://wifi.vivo.com.cn/generate_204",
    "http://www.google.com/generate_204",
];

/// Probe engine settings
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub urls: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub success_threshold: u32,
    pub transfer_idle: Duration,
}

/// Background prober over a shared candidate pool
pub struct ProbeEngine {
    pool: Arc<RwLock<Pool>>,
    config: ProbeConfig,
    dial_timeouts: DialTimeouts,
}

impl ProbeEngine {
    pub fn new(pool: Arc<RwLock<Pool>>, config: ProbeConfig, dial_timeouts: DialTimeouts) -> Self {
        ProbeEngine {
            pool,
            config,
            dial_timeouts,
        }
    }

    /// Run until the shutdown channel fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.recv() => {
                    debug!("probe engine stopped");
                    break;
                }
            }
        }
    }

    /// One probe pass over the currently-down candidates
    pub async fn sweep(&self) {
        let targets: Vec<Candidate> = {
            let pool = self.pool.read();
            if pool.recently_active(self.config.transfer_idle) {
                return;
            }
            pool.probe_targets()
                .into_iter()
                .map(|rank| pool.get(rank).candidate.clone())
                .collect()
        };

        let probes = targets.iter().map(|candidate| async move {
            (candidate, self.probe_candidate(candidate).await)
        });
        let results = futures::future::join_all(probes).await;

        // apply in rank order so a restored high-priority candidate wins
        let mut pool = self.pool.write();
        for (candidate, recovered) in results {
            if recovered {
                match pool.promote_from_probe(candidate.rank) {
                    PromoteOutcome::FailedBack => {
                        info!("recovered to higher-priority {}", candidate.url);
                    }
                    PromoteOutcome::Recovered => {
                        info!("probe restored {}", candidate.url);
                    }
                    PromoteOutcome::Unchanged => {}
                }
            } else {
                pool.demote_from_probe(candidate.rank);
            }
        }
    }

    /// Probe one candidate against the URL list until the success threshold
    async fn probe_candidate(&self, candidate: &Candidate) -> bool {
        let mut successes = 0;
        for url in &self.config.urls {
            let probe = probe_url(candidate, url, &self.dial_timeouts);
            let ok = matches!(timeout(self.config.timeout, probe).await, Ok(true));
            debug!("probe {} via {}: {}", url, candidate.url, ok);
            if ok {
                successes += 1;
                if successes >= self.config.success_threshold {
                    return true;
                }
            }
        }
        false
    }
}

/// Split a probe URL into (host, port, path, https)
fn probe_endpoint(url: &str) -> Option<(String, u16, String, bool)> {
    let parsed = Url::parse(url).ok()?;
    let https = parsed.scheme() == "https";
    let host = parsed.host_str()?.to_string();
    let port = parsed.port().unwrap_or(if https { 443 } else { 80 });
    let path = if parsed.path().is_empty() {
        "/".to_string()
    } else {
        parsed.path().to_string()
    };
    Some((host, port, path, https))
}

/// Test one URL through one candidate.
///
/// Direct candidates only need a raw TCP connect to the URL's endpoint.
/// Proxy candidates get a tunnel opened through them, a TLS handshake for
/// https targets, then a minimal HTTP/1.0 request; any plausible response
/// counts.
pub async fn probe_url(candidate: &Candidate, url: &str, timeouts: &DialTimeouts) -> bool {
    let Some((host, port, path, https)) = probe_endpoint(url) else {
        return false;
    };

    if candidate.kind == CandidateKind::Direct {
        return TcpStream::connect((host.as_str(), port)).await.is_ok();
    }

    let Ok(stream) = attempt_via(candidate, &host, port, timeouts).await else {
        return false;
    };

    if https {
        let Ok(tls) = tls_without_verification(stream, &host).await else {
            return false;
        };
        http_probe(tls, &host, &path).await
    } else {
        http_probe(stream, &host, &path).await
    }
}

async fn tls_without_verification<S>(
    stream: S,
    host: &str,
) -> std::io::Result<tokio_rustls::client::TlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad server name"))?;
    connector.connect(server_name, stream).await
}

async fn http_probe<S>(mut stream: S, host: &str, path: &str) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("GET {} HTTP/1.0\r\nHost: {}\r\n\r\n", path, host);
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let mut response = [0u8; 512];
    let Ok(n) = stream.read(&mut response).await else {
        return false;
    };
    if n == 0 {
        return false;
    }

    let body = String::from_utf8_lossy(&response[..n]);
    body.contains("200") || body.contains("204") || body.contains("Connection established") || n > 0
}

/// Certificate verifier that accepts any certificate
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::candidate::parse_candidates;

    fn timeouts() -> DialTimeouts {
        DialTimeouts {
            connect: Duration::from_secs(1),
            read: Duration::from_secs(1),
            write: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_probe_endpoint_defaults() {
        let (host, port, path, https) = probe_endpoint("https://cp.cloudflare.com/").unwrap();
        assert_eq!(host, "cp.cloudflare.com");
        assert_eq!(port, 443);
        assert_eq!(path, "/");
        assert!(https);

        let (host, port, path, https) =
            probe_endpoint("http://www.google.com/generate_204").unwrap();
        assert_eq!(host, "www.google.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/generate_204");
        assert!(!https);
    }

    #[tokio::test]
    async fn test_direct_probe_is_a_tcp_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let direct = parse_candidates("DIRECT", false).unwrap().remove(0);
        let url = format!("http://127.0.0.1:{}/", addr.port());
        assert!(probe_url(&direct, &url, &timeouts()).await);
        accept.await.unwrap();
    }

    #[tokio::test]
    async fn test_direct_probe_fails_on_closed_port() {
        // a freshly bound-and-dropped listener leaves the port closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let direct = parse_candidates("DIRECT", false).unwrap().remove(0);
        let url = format!("http://127.0.0.1:{}/", addr.port());
        assert!(!probe_url(&direct, &url, &timeouts()).await);
    }

    #[tokio::test]
    async fn test_sweep_suppressed_while_traffic_flows() {
        // a pool whose last transfer was just now must not be probed; the
        // unreachable proxy would otherwise be dialed and demoted further
        let pool = Arc::new(RwLock::new(Pool::new(
            parse_candidates("socks5://127.0.0.1:1,socks5://127.0.0.1:2", false).unwrap(),
        )));
        pool.write().demote_from_probe(0);
        let fails_before = pool.read().get(0).fail_count;

        let engine = ProbeEngine::new(
            pool.clone(),
            ProbeConfig {
                urls: vec!["http://127.0.0.1:1/".to_string()],
                interval: Duration::from_secs(30),
                timeout: Duration::from_millis(200),
                success_threshold: 1,
                transfer_idle: Duration::from_secs(300),
            },
            timeouts(),
        );

        pool.write().on_transfer_ok();
        engine.sweep().await;
        assert_eq!(
            pool.read().get(0).fail_count,
            fails_before,
            "sweep must be a no-op while the link is active"
        );
    }

    #[tokio::test]
    async fn test_sweep_demotes_unreachable_candidate() {
        let pool = Arc::new(RwLock::new(Pool::new(
            parse_candidates("socks5://127.0.0.1:1,DIRECT", false).unwrap(),
        )));
        pool.write().demote_from_probe(0);
        let fails_before = pool.read().get(0).fail_count;

        let engine = ProbeEngine::new(
            pool.clone(),
            ProbeConfig {
                urls: vec!["http://127.0.0.1:1/".to_string()],
                interval: Duration::from_secs(30),
                timeout: Duration::from_millis(500),
                success_threshold: 1,
                transfer_idle: Duration::ZERO,
            },
            timeouts(),
        );

        engine.sweep().await;
        let pool = pool.read();
        assert!(!pool.get(0).healthy);
        assert!(pool.get(0).fail_count > fails_before);
    }
}

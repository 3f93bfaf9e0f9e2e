//! Inbound TLS transport server
//!
//! Terminates camouflage-TLS client sessions and forwards each accepted
//! stream through the egress dialer. The listener runs until ctrl-c, then
//! drains active connections before exiting.

mod session;
mod tls;

pub use session::{handle, SessionContext, CMD_TCP, CMD_UOT};
pub use tls::self_signed_config;

use crate::config::Config;
use crate::egress::{Dialer, EgressDialer, SystemDialer};
use crate::padding::PaddingFactory;
use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Transport server instance
pub struct Server {
    config: Config,
    acceptor: TlsAcceptor,
    session_ctx: Arc<SessionContext>,
    egress: Option<Arc<EgressDialer>>,
    active_connections: Arc<AtomicI64>,
}

impl Server {
    /// Build a server from validated configuration
    pub fn new(config: Config) -> Result<Self> {
        let tls_config = self_signed_config(&config.sni)?;
        let acceptor = TlsAcceptor::from(tls_config);

        let padding = match &config.padding_scheme {
            Some(path) => {
                let raw = std::fs::read(path)?;
                let factory = PaddingFactory::parse(&raw)?;
                info!("loaded record-size scheme {} ({})", path, factory.digest());
                factory
            }
            None => PaddingFactory::default_scheme(),
        };

        let (dialer, egress): (Arc<dyn Dialer>, Option<Arc<EgressDialer>>) =
            if config.egress.dial.is_empty() {
                info!("using direct outbound connection");
                let system = Arc::new(SystemDialer::new(config.egress.connect_timeout()));
                (system, None)
            } else {
                info!("using outbound egress pool: {}", config.egress.dial);
                if config.egress.dial_fallback {
                    info!("direct fallback enabled");
                }
                let egress = Arc::new(EgressDialer::new(&config.egress).map_err(Error::Dial)?);
                debug!(
                    "egress pool state: {}",
                    serde_json::to_string(&egress.status()).unwrap_or_default()
                );
                (egress.clone(), Some(egress))
            };

        let password_digest: [u8; 32] = Sha256::digest(config.password.as_bytes()).into();

        let session_ctx = Arc::new(SessionContext {
            password_digest,
            dialer,
            egress: egress.clone(),
            padding: Arc::new(padding),
            read_timeout: config.egress.read_timeout(),
        });

        Ok(Server {
            config,
            acceptor,
            session_ctx,
            egress,
            active_connections: Arc::new(AtomicI64::new(0)),
        })
    }

    /// Per-candidate egress state for diagnostics; `None` without a pool
    pub fn egress_status(&self) -> Option<crate::egress::PoolStatus> {
        self.egress.as_ref().map(|e| e.status())
    }

    /// Accept sessions until ctrl-c, then drain
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!("listening on {} (sni {})", self.config.listen, self.config.sni);

        // periodic gauge of live sessions
        let gauge = self.active_connections.clone();
        let stats = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let count = gauge.load(Ordering::Relaxed);
                if count > 0 {
                    info!("active connections: {}", count);
                }
            }
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {}", e);
                            continue;
                        }
                    };
                    self.spawn_session(stream, peer);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down gracefully");
                    break;
                }
            }
        }

        stats.abort();
        if let Some(egress) = &self.egress {
            egress.close();
        }
        self.drain().await;
        info!("server stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let acceptor = self.acceptor.clone();
        let ctx = self.session_ctx.clone();
        let gauge = self.active_connections.clone();

        gauge.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let result = async {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| Error::tls(e.to_string()))?;
                session::handle(tls_stream, &ctx).await
            }
            .await;

            if let Err(e) = result {
                debug!("session from {} ended: {}", peer, e);
            }
            gauge.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Wait for live sessions to finish, bounded by the grace period
    async fn drain(&self) {
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        loop {
            let count = self.active_connections.load(Ordering::Relaxed);
            if count == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown grace expired with {} connections open", count);
                return;
            }
            info!("waiting for {} connections to close", count);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }
}

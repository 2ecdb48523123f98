//! Tunnel server.
//!
//! RAM-only session state, a persistent device binding table, and one
//! TCP/UDP listener pair per configuration record:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Server                              │
//! │  ┌──────────────┐  ┌──────────────┐        ┌──────────────┐  │
//! │  │ TCP listener │  │ UDP listener │  ...   │   Reaper     │  │
//! │  │  (per cfg)   │  │  (per cfg)   │        │  (5 min)     │  │
//! │  └──────┬───────┘  └──────────────┘        └──────┬───────┘  │
//! │         │ TLS accept                              │          │
//! │         ▼                                         ▼          │
//! │  ┌──────────────────┐  bind_or_check  ┌──────────────────┐   │
//! │  │ Connection task  │────────────────▶│ Binding store    │   │
//! │  │ handshake, loop  │                 └──────────────────┘   │
//! │  └──────┬───────────┘  insert/release ┌──────────────────┐   │
//! │         └────────────────────────────▶│ Session registry │   │
//! │                                       └──────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod binding;
mod config;
mod connection;
mod handshake;
mod listener;
mod metrics;
mod session;
mod tls;

pub use binding::{BindOutcome, DeviceBindingStore};
pub use config::{
    ConfigSet, EngineSettings, NovaGuardConfig, DEFAULT_CERT_FILE, DEFAULT_DEVICE_MAP_FILE,
    DEFAULT_KEY_FILE, MULTI_CONFIG_FILE, SINGLE_CONFIG_FILE,
};
pub use connection::{serve_stream, EchoHandler, EngineContext, PacketHandler};
pub use handshake::{
    build_ack, parse_ack, HandshakeMessage, HandshakeNegotiator, ACK_LEN, ACK_MARKER,
    MAX_HANDSHAKE_LEN,
};
pub use listener::{TcpTunnelListener, UdpListener};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use session::{Session, SessionId, SessionInfo, SessionRegistry};
pub use tls::{load_certs, load_private_key, load_tls_acceptor, load_tls_config};

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Main server instance.
pub struct Server {
    configs: ConfigSet,
    ctx: Arc<EngineContext>,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a server for `configs`, loading TLS material from the first record.
    pub fn new(configs: ConfigSet, settings: EngineSettings) -> Result<Self> {
        let primary = configs.primary();
        let acceptor = load_tls_acceptor(&primary.cert_path(), &primary.key_path())?;
        Ok(Self::with_acceptor(configs, EngineContext::new(settings), acceptor))
    }

    /// Create a server from already-built parts.
    pub fn with_acceptor(configs: ConfigSet, ctx: EngineContext, acceptor: TlsAcceptor) -> Self {
        Self {
            configs,
            ctx: Arc::new(ctx),
            acceptor,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops every listener, the reaper and all packet loops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start all listeners and block until shutdown.
    ///
    /// Every socket is bound before any task starts, so a bind error leaves
    /// nothing running.
    pub async fn run(&self) -> Result<()> {
        let mut bound = Vec::with_capacity(self.configs.len());
        for config in self.configs.configs() {
            let tcp = TcpTunnelListener::bind(any_addr(config.tcp_port)).await?;
            let udp = UdpListener::bind(any_addr(config.udp_port)).await?;
            bound.push((config.config_id.clone(), tcp, udp));
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let ctx = Arc::clone(&self.ctx);
        let shutdown = self.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            ctx.registry
                .run_reaper(
                    ctx.settings.sweep_interval,
                    ctx.settings.session_ttl,
                    &ctx.metrics,
                    shutdown,
                )
                .await;
        }));

        for (config_id, tcp, udp) in bound {
            tracing::info!("Starting listeners for config {:?}", config_id);
            tasks.push(tokio::spawn(tcp.run(
                Arc::clone(&self.ctx),
                self.acceptor.clone(),
                self.shutdown.clone(),
            )));
            tasks.push(tokio::spawn(
                udp.run(Arc::clone(&self.ctx), self.shutdown.clone()),
            ));
        }

        self.shutdown.cancelled().await;

        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Server task ended abnormally: {}", e);
            }
        }
        Ok(())
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.ctx.metrics
    }

    /// Shared engine state.
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Configuration records served.
    pub fn configs(&self) -> &ConfigSet {
        &self.configs
    }

    /// Get session count.
    pub fn session_count(&self) -> usize {
        self.ctx.registry.count()
    }
}

fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))
}

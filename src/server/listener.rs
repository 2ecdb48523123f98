//! TCP and UDP listeners.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::server::connection::{serve_stream, EngineContext};

/// Largest UDP datagram read in one call.
const MAX_DATAGRAM: usize = 65_535;

/// Accepts TLS connections and runs one tunnel task per connection.
pub struct TcpTunnelListener {
    listener: TcpListener,
}

impl TcpTunnelListener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` fires. Accept errors are logged and skipped.
    pub async fn run(self, ctx: Arc<EngineContext>, acceptor: TlsAcceptor, shutdown: CancellationToken) {
        let local = self.listener.local_addr().ok();
        tracing::info!("NovaGuard TCP listening on {:?}", local);

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("{}", Error::Accept(e));
                        continue;
                    }
                },
            };

            let ctx = Arc::clone(&ctx);
            let acceptor = acceptor.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                ctx.metrics.increment_connections();

                if let Err(e) = handle_connection(stream, peer_addr, &ctx, acceptor, shutdown).await {
                    if e.is_handshake_error() {
                        tracing::debug!("Handshake with {} failed: {}", peer_addr, e);
                    } else {
                        tracing::warn!("Connection error from {}: {}", peer_addr, e);
                    }
                }

                ctx.metrics.decrement_connections();
            });
        }

        tracing::info!("NovaGuard TCP listener on {:?} stopped", local);
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    ctx: &Arc<EngineContext>,
    acceptor: TlsAcceptor,
    shutdown: CancellationToken,
) -> Result<()> {
    stream.set_nodelay(true)?;

    let deadline = ctx.settings.handshake_timeout;
    let tls = match tokio::time::timeout(deadline, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            ctx.metrics.increment_handshake_failures();
            return Err(Error::TlsHandshake(e));
        }
        Err(_) => {
            ctx.metrics.increment_handshake_failures();
            return Err(Error::HandshakeTimeout(deadline.as_millis() as u64));
        }
    };

    serve_stream(tls, Arc::clone(ctx), Some(peer_addr), shutdown).await
}

/// Receives raw datagrams on the UDP port.
///
/// Datagrams are logged and counted; no session is attached to them.
pub struct UdpListener {
    socket: UdpSocket,
}

impl UdpListener {
    /// Bind to `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive until `shutdown` fires, polling with the configured interval.
    pub async fn run(self, ctx: Arc<EngineContext>, shutdown: CancellationToken) {
        let local = self.socket.local_addr().ok();
        tracing::info!("NovaGuard UDP listening on {:?}", local);

        let poll = ctx.settings.udp_poll_interval;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = tokio::time::timeout(poll, self.socket.recv_from(&mut buf)) => received,
            };

            match received {
                Ok(Ok((len, from))) => {
                    ctx.metrics.increment_udp_datagrams();
                    ctx.metrics.add_bytes_received(len as u64);
                    tracing::debug!("UDP datagram of {} bytes from {}", len, from);
                }
                Ok(Err(e)) => tracing::warn!("UDP receive error: {}", e),
                Err(_) => {}
            }
        }

        tracing::info!("NovaGuard UDP listener on {:?} stopped", local);
    }
}

//! Per-connection state machine.
//!
//! An authenticated stream goes through the binding handshake, registers a
//! session, then loops reading obfuscated packets until the peer hangs up,
//! the registry closes the session, or the server shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::obfuscation::{read_packet, Fragmenter, PacketCodec};
use crate::server::binding::DeviceBindingStore;
use crate::server::config::EngineSettings;
use crate::server::handshake::HandshakeNegotiator;
use crate::server::metrics::ServerMetrics;
use crate::server::session::{Session, SessionRegistry};

/// Consumes decoded payloads and optionally answers them.
pub trait PacketHandler: Send + Sync {
    /// Handle one payload; a returned buffer is sent back on the same session.
    fn handle(&self, session: &Session, payload: Vec<u8>) -> Option<Vec<u8>>;
}

/// Sends every payload straight back.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl PacketHandler for EchoHandler {
    fn handle(&self, _session: &Session, payload: Vec<u8>) -> Option<Vec<u8>> {
        Some(payload)
    }
}

/// State shared by every connection task.
pub struct EngineContext {
    /// Persistent config-to-device bindings
    pub bindings: Arc<DeviceBindingStore>,
    /// Live sessions
    pub registry: Arc<SessionRegistry>,
    /// Aggregate counters
    pub metrics: Arc<ServerMetrics>,
    /// Runtime tunables
    pub settings: EngineSettings,
    /// Payload consumer
    pub handler: Arc<dyn PacketHandler>,
}

impl EngineContext {
    /// Build a context, loading the binding table named by `settings`.
    pub fn new(settings: EngineSettings) -> Self {
        let bindings = match &settings.device_map_path {
            Some(path) => DeviceBindingStore::load(path.clone()),
            None => DeviceBindingStore::in_memory(),
        };

        Self {
            bindings: Arc::new(bindings),
            registry: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(ServerMetrics::new()),
            settings,
            handler: Arc::new(EchoHandler),
        }
    }

    /// Replace the payload handler.
    pub fn with_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handler = handler;
        self
    }
}

/// Drive one authenticated stream to completion.
///
/// Handshake errors are returned without registering anything. Once a session
/// is registered it is released on every exit path.
pub async fn serve_stream<S>(
    mut stream: S,
    ctx: Arc<EngineContext>,
    peer_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session = match establish(&mut stream, &ctx, peer_addr).await {
        Ok(session) => Arc::new(session),
        Err(e) => {
            ctx.metrics.increment_handshake_failures();
            if matches!(e, Error::DeviceMismatch { .. }) {
                ctx.metrics.increment_device_mismatches();
            }
            return Err(e);
        }
    };

    ctx.metrics.increment_handshakes();
    if let Some(previous) = ctx.registry.insert(Arc::clone(&session)) {
        ctx.metrics.increment_sessions_replaced();
        tracing::info!(
            peer = ?peer_addr,
            "Session {} for config {} replaced by session {}",
            previous.id(),
            session.config_id(),
            session.id()
        );
    }
    tracing::info!(
        peer = ?peer_addr,
        "Session {} established for config {}",
        session.id(),
        session.config_id()
    );

    let result = packet_loop(&mut stream, &ctx, &session, &shutdown).await;

    ctx.registry.release(&session);
    let _ = stream.shutdown().await;

    tracing::debug!(
        peer = ?peer_addr,
        "Session {} for config {} ended",
        session.id(),
        session.config_id()
    );
    result
}

async fn establish<S>(
    stream: &mut S,
    ctx: &EngineContext,
    peer_addr: Option<SocketAddr>,
) -> Result<Session>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = ctx.settings.handshake_timeout;
    let negotiator =
        HandshakeNegotiator::new(&ctx.bindings).with_max_len(ctx.settings.handshake_buffer);

    tokio::time::timeout(deadline, negotiator.negotiate(stream, peer_addr))
        .await
        .map_err(|_| Error::HandshakeTimeout(deadline.as_millis() as u64))?
}

async fn packet_loop<S>(
    stream: &mut S,
    ctx: &EngineContext,
    session: &Session,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let codec = PacketCodec::new(session.key());
    let fragmenter = Fragmenter::new(ctx.settings.fragment);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = session.closed() => {
                tracing::debug!(
                    peer = ?session.peer_addr(),
                    "Session {} for config {} closed by the registry",
                    session.id(),
                    session.config_id()
                );
                return Ok(());
            }
            frame = read_packet(&mut *stream) => frame?,
        };

        let Some(frame) = frame else {
            return Ok(());
        };
        ctx.metrics.add_bytes_received(frame.len() as u64);

        let payload = match codec.decode(&frame) {
            Ok(payload) => payload,
            Err(e) if e.is_packet_error() => {
                ctx.metrics.increment_packets_rejected();
                tracing::warn!(
                    peer = ?session.peer_addr(),
                    "Dropping packet on session {} (config {}): {}",
                    session.id(),
                    session.config_id(),
                    e
                );
                continue;
            }
            Err(e) => return Err(e),
        };

        ctx.metrics.increment_packets_processed();
        session.record_received(payload.len());

        if let Some(reply) = ctx.handler.handle(session, payload) {
            let packet = codec.encode(&reply)?;
            fragmenter.send(&mut *stream, &packet).await?;

            session.record_sent(reply.len());
            ctx.metrics.add_bytes_sent(packet.len() as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AeadKey;
    use crate::obfuscation::{decode, encode, FragmentConfig};
    use crate::server::handshake::{parse_ack, HandshakeMessage, ACK_LEN};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::task::JoinHandle;

    fn context() -> Arc<EngineContext> {
        let settings = EngineSettings {
            device_map_path: None,
            fragment: FragmentConfig {
                count: 3,
                delay: Duration::ZERO,
            },
            ..EngineSettings::default()
        };
        Arc::new(EngineContext::new(settings))
    }

    fn spawn_server(
        ctx: &Arc<EngineContext>,
        shutdown: &CancellationToken,
    ) -> (DuplexStream, JoinHandle<Result<()>>) {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve_stream(
            server,
            Arc::clone(ctx),
            None,
            shutdown.clone(),
        ));
        (client, task)
    }

    async fn handshake(client: &mut DuplexStream, config_id: &str, device_id: &str) -> AeadKey {
        client
            .write_all(&HandshakeMessage::new(config_id, device_id).to_bytes())
            .await
            .unwrap();
        let mut ack = [0u8; ACK_LEN];
        client.read_exact(&mut ack).await.unwrap();
        parse_ack(&ack).unwrap()
    }

    async fn roundtrip(client: &mut DuplexStream, key: &AeadKey, payload: &[u8]) -> Vec<u8> {
        client.write_all(&encode(payload, key).unwrap()).await.unwrap();
        let frame = read_packet(client).await.unwrap().unwrap();
        decode(&frame, key).unwrap()
    }

    #[tokio::test]
    async fn test_echo_session() {
        let ctx = context();
        let shutdown = CancellationToken::new();
        let (mut client, task) = spawn_server(&ctx, &shutdown);

        let key = handshake(&mut client, "cfg1", "dev1").await;
        assert_eq!(roundtrip(&mut client, &key, b"ping").await, b"ping");
        assert_eq!(roundtrip(&mut client, &key, &[7u8; 3000]).await, vec![7u8; 3000]);

        let session = ctx.registry.get("cfg1").unwrap();
        assert_eq!(session.device_id(), "dev1");
        assert_eq!(session.key(), &key);

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(ctx.registry.count(), 0);

        let metrics = ctx.metrics.snapshot();
        assert_eq!(metrics.handshakes_completed, 1);
        assert_eq!(metrics.packets_processed, 2);
    }

    #[tokio::test]
    async fn test_bad_packet_is_skipped() {
        let ctx = context();
        let shutdown = CancellationToken::new();
        let (mut client, task) = spawn_server(&ctx, &shutdown);

        let key = handshake(&mut client, "cfg1", "dev1").await;

        let forged = encode(b"forged", &AeadKey::generate()).unwrap();
        client.write_all(&forged).await.unwrap();
        assert_eq!(roundtrip(&mut client, &key, b"after").await, b"after");

        assert_eq!(ctx.metrics.snapshot().packets_rejected, 1);
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_device_mismatch_registers_nothing() {
        let ctx = context();
        assert!(ctx.bindings.bind_or_check("cfg1", "dev1"));
        let shutdown = CancellationToken::new();
        let (mut client, task) = spawn_server(&ctx, &shutdown);

        client
            .write_all(&HandshakeMessage::new("cfg1", "dev2").to_bytes())
            .await
            .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::DeviceMismatch { .. })));
        assert_eq!(ctx.registry.count(), 0);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(ctx.metrics.snapshot().device_mismatches, 1);
    }

    #[tokio::test]
    async fn test_rehandshake_replaces_session() {
        let ctx = context();
        let shutdown = CancellationToken::new();

        let (mut first, first_task) = spawn_server(&ctx, &shutdown);
        let first_key = handshake(&mut first, "cfg1", "dev1").await;
        assert_eq!(roundtrip(&mut first, &first_key, b"one").await, b"one");
        let first_id = ctx.registry.get("cfg1").unwrap().id();

        let (mut second, second_task) = spawn_server(&ctx, &shutdown);
        let second_key = handshake(&mut second, "cfg1", "dev1").await;
        assert_ne!(first_key, second_key);

        first_task.await.unwrap().unwrap();
        let current = ctx.registry.get("cfg1").unwrap();
        assert_ne!(current.id(), first_id);

        assert_eq!(roundtrip(&mut second, &second_key, b"still here").await, b"still here");
        assert_eq!(ctx.metrics.snapshot().sessions_replaced, 1);

        shutdown.cancel();
        second_task.await.unwrap().unwrap();
        assert_eq!(ctx.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_reaped_session_is_closed() {
        const MINUTE: Duration = Duration::from_secs(60);

        let ctx = context();
        let shutdown = CancellationToken::new();

        let (mut old, old_task) = spawn_server(&ctx, &shutdown);
        let old_key = handshake(&mut old, "cfg1", "dev1").await;
        assert_eq!(roundtrip(&mut old, &old_key, b"before").await, b"before");

        let now = tokio::time::Instant::now() + 61 * MINUTE;
        assert_eq!(ctx.registry.sweep(now, 60 * MINUTE), 1);
        old_task.await.unwrap().unwrap();

        let mut rest = Vec::new();
        old.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let (mut fresh, fresh_task) = spawn_server(&ctx, &shutdown);
        let fresh_key = handshake(&mut fresh, "cfg1", "dev1").await;
        assert_eq!(roundtrip(&mut fresh, &fresh_key, b"after").await, b"after");
        assert_eq!(ctx.metrics.snapshot().sessions_replaced, 0);

        shutdown.cancel();
        fresh_task.await.unwrap().unwrap();
        assert_eq!(ctx.registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let ctx = context();
        let shutdown = CancellationToken::new();
        let (_client, task) = spawn_server(&ctx, &shutdown);

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(Error::HandshakeTimeout(ms)) if ms == crate::HANDSHAKE_TIMEOUT_MS
        ));
        assert_eq!(ctx.metrics.snapshot().handshake_failures, 1);
    }

    #[tokio::test]
    async fn test_custom_handler() {
        struct Upper;
        impl PacketHandler for Upper {
            fn handle(&self, _session: &Session, payload: Vec<u8>) -> Option<Vec<u8>> {
                if payload.is_empty() {
                    None
                } else {
                    Some(payload.to_ascii_uppercase())
                }
            }
        }

        let settings = EngineSettings {
            device_map_path: None,
            ..EngineSettings::default()
        };
        let ctx = Arc::new(EngineContext::new(settings).with_handler(Arc::new(Upper)));
        let shutdown = CancellationToken::new();
        let (mut client, task) = spawn_server(&ctx, &shutdown);

        let key = handshake(&mut client, "cfg1", "dev1").await;
        client.write_all(&encode(b"", &key).unwrap()).await.unwrap();
        assert_eq!(roundtrip(&mut client, &key, b"ping").await, b"PING");

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(ctx.metrics.snapshot().packets_processed, 2);
    }
}

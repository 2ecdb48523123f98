//! End-to-end engine scenarios over in-memory streams.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio_util::sync::CancellationToken;

use novaguard::crypto::AeadKey;
use novaguard::obfuscation::{decode, encode, read_packet, FragmentConfig};
use novaguard::server::{
    parse_ack, serve_stream, EngineContext, EngineSettings, HandshakeMessage, ACK_LEN,
};
use novaguard::Error;

fn settings(device_map: Option<std::path::PathBuf>) -> EngineSettings {
    EngineSettings {
        device_map_path: device_map,
        fragment: FragmentConfig {
            count: 3,
            delay: Duration::from_millis(1),
        },
        ..EngineSettings::default()
    }
}

fn connect(
    ctx: &Arc<EngineContext>,
    shutdown: &CancellationToken,
) -> (DuplexStream, tokio::task::JoinHandle<novaguard::Result<()>>) {
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

async fn exchange(client: &mut DuplexStream, key: &AeadKey, payload: &[u8]) -> Vec<u8> {
    client.write_all(&encode(payload, key).unwrap()).await.unwrap();
    let frame = read_packet(client).await.unwrap().expect("reply frame");
    decode(&frame, key).unwrap()
}

#[tokio::test]
async fn bind_then_echo_then_reject_other_device() {
    let ctx = Arc::new(EngineContext::new(settings(None)));
    let shutdown = CancellationToken::new();

    let (mut client, task) = connect(&ctx, &shutdown);
    let key = handshake(&mut client, "cfg1", "dev1").await;
    assert_eq!(exchange(&mut client, &key, b"ping").await, b"ping");

    let session = ctx.registry.get("cfg1").expect("session registered");
    assert_eq!(session.device_id(), "dev1");
    assert_eq!(ctx.bindings.get("cfg1").as_deref(), Some("dev1"));

    let (mut intruder, intruder_task) = connect(&ctx, &shutdown);
    intruder
        .write_all(&HandshakeMessage::new("cfg1", "dev2").to_bytes())
        .await
        .unwrap();
    let result = intruder_task.await.unwrap();
    assert!(matches!(result, Err(Error::DeviceMismatch { .. })));

    let mut reply = Vec::new();
    intruder.read_to_end(&mut reply).await.unwrap();
    assert!(reply.is_empty(), "rejected device gets no bytes");

    // the legitimate session is untouched
    assert_eq!(ctx.registry.get("cfg1").unwrap().id(), session.id());
    assert_eq!(exchange(&mut client, &key, b"still bound").await, b"still bound");

    shutdown.cancel();
    task.await.unwrap().unwrap();
    assert_eq!(ctx.registry.count(), 0);
}

#[tokio::test]
async fn bindings_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let map = dir.path().join("config_device_map.json");

    {
        let ctx = Arc::new(EngineContext::new(settings(Some(map.clone()))));
        let shutdown = CancellationToken::new();
        let (mut client, task) = connect(&ctx, &shutdown);
        let key = handshake(&mut client, "cfg1", "dev1").await;
        assert_eq!(exchange(&mut client, &key, b"hi").await, b"hi");
        drop(client);
        task.await.unwrap().unwrap();
    }

    let ctx = Arc::new(EngineContext::new(settings(Some(map))));
    assert_eq!(ctx.bindings.get("cfg1").as_deref(), Some("dev1"));

    let shutdown = CancellationToken::new();
    let (mut client, task) = connect(&ctx, &shutdown);
    client
        .write_all(&HandshakeMessage::new("cfg1", "dev2").to_bytes())
        .await
        .unwrap();
    assert!(matches!(
        task.await.unwrap(),
        Err(Error::DeviceMismatch { .. })
    ));
}

#[tokio::test]
async fn many_configs_run_concurrently() {
    let ctx = Arc::new(EngineContext::new(settings(None)));
    let shutdown = CancellationToken::new();

    let mut clients = Vec::new();
    for i in 0..8 {
        let (mut client, task) = connect(&ctx, &shutdown);
        let key = handshake(&mut client, &format!("cfg{}", i), &format!("dev{}", i)).await;
        clients.push((client, task, key, i));
    }

    for (client, _, key, i) in clients.iter_mut() {
        let payload = format!("payload {}", i);
        assert_eq!(exchange(client, key, payload.as_bytes()).await, payload.as_bytes());
    }
    assert_eq!(ctx.registry.count(), 8);
    assert_eq!(ctx.registry.snapshot().len(), 8);

    shutdown.cancel();
    for (_, task, _, _) in clients {
        task.await.unwrap().unwrap();
    }
    assert_eq!(ctx.registry.count(), 0);
}

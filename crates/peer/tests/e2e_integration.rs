//! End-to-end integration tests for Duplink.
//!
//! These tests run real servers, clients and relays over loopback TCP:
//! - RPC over each negotiation step
//! - Relay tunnels
//! - Pool sharing, rejection, timeouts and shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use peer::protocol::{CryptoEngine, CryptoHandshakeStep, NegotiationPipeline, SharedSecretGateStep};
use peer::{
    CommandRegistry, Config, EntryConfig, ExitConfig, RelayTarget, RpcClient, RpcError, RpcServer,
    TcpRelay,
};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const LOCALHOST: &str = "127.0.0.1";

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    text: String,
}

/// A config listening on loopback with every step off.
fn plain_config() -> Config {
    let mut config = Config::default();
    config.rpc.listen_host = LOCALHOST.to_string();
    config.crypto.enabled = false;
    config.crypto.asymmetric_key_bits = 1024;
    config
}

fn hello_registry() -> Arc<CommandRegistry> {
    let mut registry = CommandRegistry::new();
    registry
        .register("Hello", |_ctx, hello: Hello| async move {
            Ok(format!("Hello, {}!", hello.text))
        })
        .register("Slow", |_ctx, _: ()| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });
    Arc::new(registry)
}

fn crypto_pipeline(seed: u64) -> NegotiationPipeline {
    let engine = CryptoEngine::seeded(seed).with_asymmetric_bits(1024).unwrap();
    NegotiationPipeline::new().with_step(CryptoHandshakeStep::new(engine))
}

fn client(pipeline: NegotiationPipeline) -> RpcClient {
    RpcClient::with_pipeline(pipeline, Arc::new(CommandRegistry::new()))
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// RPC
// =============================================================================

#[tokio::test]
async fn test_hello_over_crypto_handshake() {
    let server = RpcServer::start(&plain_config(), hello_registry(), crypto_pipeline(1))
        .await
        .unwrap();
    let client = client(crypto_pipeline(2));

    let reply: String = client
        .send_command_and_wait_response(
            LOCALHOST,
            server.local_addr().port(),
            "Hello",
            &Hello {
                text: "Bob".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(reply, "Hello, Bob!");

    client.close_all().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tag_leaves_connection_usable() {
    let server = RpcServer::start(&plain_config(), hello_registry(), NegotiationPipeline::new())
        .await
        .unwrap();
    let port = server.local_addr().port();
    let client = client(NegotiationPipeline::new());

    // Fire-and-forget: dropped on the server, nothing comes back.
    client.send_command(LOCALHOST, port, "DoesNotExist", &()).await.unwrap();

    let err = client
        .send_command_and_wait_response::<_, ()>(LOCALHOST, port, "DoesNotExist", &())
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::UnknownTag(_)));

    let reply: String = client
        .send_command_and_wait_response(LOCALHOST, port, "Hello", &Hello { text: "again".into() })
        .await
        .unwrap();
    assert_eq!(reply, "Hello, again!");
    assert_eq!(client.pool().connect_attempts(), 1);
    assert_eq!(server.accepted_total(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_fifty_concurrent_callers_share_one_connection() {
    let server = RpcServer::start(&plain_config(), hello_registry(), crypto_pipeline(3))
        .await
        .unwrap();
    let port = server.local_addr().port();
    let client = Arc::new(client(crypto_pipeline(4)));

    let callers: Vec<_> = (0..50)
        .map(|i| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let channel = client.connect(LOCALHOST, port).await.unwrap();
                let reply: String = channel
                    .request("Hello", &Hello { text: i.to_string() })
                    .await
                    .unwrap();
                assert_eq!(reply, format!("Hello, {i}!"));
                channel.id()
            })
        })
        .collect();

    let mut ids = Vec::new();
    for caller in callers {
        ids.push(caller.await.unwrap());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(client.pool().connect_attempts(), 1);
    assert_eq!(server.accepted_total(), 1);

    client.close_all().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_wrong_shared_secret_is_rejected() {
    let server_pipeline = NegotiationPipeline::new().with_step(SharedSecretGateStep::new("open sesame"));
    let server = RpcServer::start(&plain_config(), hello_registry(), server_pipeline)
        .await
        .unwrap();
    let client = client(NegotiationPipeline::new().with_step(SharedSecretGateStep::new("guess")));

    let err = client
        .send_command_and_wait_response::<_, String>(
            LOCALHOST,
            server.local_addr().port(),
            "Hello",
            &Hello { text: "Eve".into() },
        )
        .await
        .unwrap_err();
    assert!(err.is_connection_failure(), "unexpected error: {err}");
    assert!(matches!(err, RpcError::Rejected { .. }));
    assert_eq!(client.connection_count(), 0);

    eventually(|| server.accepted_total() == 1).await;
    assert_eq!(server.connection_count(), 0);
    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_peer_hits_negotiation_timeout() {
    let mut config = plain_config();
    config.crypto.enabled = true;
    config.crypto.timeout_ms = 300;
    let server = RpcServer::from_config(&config, hello_registry()).await.unwrap();

    let started = Instant::now();
    let mut silent = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut sink = Vec::new();
    // Whatever the server wrote first, it must hang up once the deadline passes.
    let _ = tokio::time::timeout(Duration::from_secs(10), silent.read_to_end(&mut sink))
        .await
        .expect("server kept a silent peer open");
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(server.connection_count(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_pending_request_fails_when_server_stops() {
    let server = RpcServer::start(&plain_config(), hello_registry(), NegotiationPipeline::new())
        .await
        .unwrap();
    // The client owns the pooled channel, so it must outlive the call.
    let client = client(NegotiationPipeline::new());
    let channel = client
        .connect(LOCALHOST, server.local_addr().port())
        .await
        .unwrap();

    let waiting = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.request::<_, ()>("Slow", &()).await })
    };
    eventually(|| channel.pending_requests() == 1).await;

    server.shutdown().await;

    let err = tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("caller hung after the connection closed")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RpcError::ConnectionClosed));
    assert_eq!(err.to_string(), "connection closed while waiting for response");
    assert!(channel.is_closed());
}

#[tokio::test]
async fn test_server_connects_back_to_advertised_port() {
    // The "client" peer runs its own listener.
    let mut client_side = CommandRegistry::new();
    client_side.register("Whoami", |_ctx, _: ()| async move { Ok("client-side") });
    let listener = RpcServer::start(&plain_config(), Arc::new(client_side), NegotiationPipeline::new())
        .await
        .unwrap();

    let server = RpcServer::start(&plain_config(), hello_registry(), NegotiationPipeline::new())
        .await
        .unwrap();
    let client = client(NegotiationPipeline::new()).with_reverse_capability(listener.local_addr().port());

    let _: String = client
        .send_command_and_wait_response(
            LOCALHOST,
            server.local_addr().port(),
            "Hello",
            &Hello { text: "Ann".into() },
        )
        .await
        .unwrap();

    eventually(|| {
        server
            .connections()
            .iter()
            .any(|channel| channel.reverse_port().is_some())
    })
    .await;
    let inbound = server.connections().pop().unwrap();
    assert_eq!(inbound.reverse_addr().unwrap().port(), listener.local_addr().port());

    let back = server.connect_back(&inbound).await.unwrap();
    let who: String = back.request("Whoami", &()).await.unwrap();
    assert_eq!(who, "client-side");

    server.shutdown().await;
    listener.shutdown().await;
    assert!(back.is_closed());
}

// =============================================================================
// TLS from configuration
// =============================================================================

/// Writes a CA and a "localhost" leaf signed by it; returns (ca, cert, key) paths.
fn write_tls_material(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf, std::path::PathBuf) {
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name.push(DnType::CommonName, "duplink test ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    leaf_params.distinguished_name.push(DnType::CommonName, "localhost");
    let leaf_key = KeyPair::generate().unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

    let ca_path = dir.path().join("ca.pem");
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    std::fs::write(&ca_path, ca.pem()).unwrap();
    std::fs::write(&cert_path, leaf.pem()).unwrap();
    std::fs::write(&key_path, leaf_key.serialize_pem()).unwrap();
    (ca_path, cert_path, key_path)
}

#[tokio::test]
async fn test_mutual_tls_and_shared_secret_from_config() {
    let dir = TempDir::new().unwrap();
    let (ca, cert, key) = write_tls_material(&dir);

    let mut config = plain_config();
    config.tls.enabled = true;
    config.tls.ca_cert = Some(ca);
    config.tls.cert = Some(cert);
    config.tls.key = Some(key);
    config.shared_secret.password = Some("hunter2".to_string());
    config.validate().unwrap();
    assert_eq!(
        config.incoming_pipeline().unwrap().step_names(),
        vec!["tls", "shared-secret"]
    );

    let server = RpcServer::from_config(&config, hello_registry()).await.unwrap();
    let client = RpcClient::from_config(&config, Arc::new(CommandRegistry::new()), None).unwrap();

    let reply: String = client
        .send_command_and_wait_response(
            LOCALHOST,
            server.local_addr().port(),
            "Hello",
            &Hello { text: "TLS".into() },
        )
        .await
        .unwrap();
    assert_eq!(reply, "Hello, TLS!");

    eventually(|| server.connection_count() == 1).await;

    client.close_all().await;
    server.shutdown().await;
}

// =============================================================================
// Relay
// =============================================================================

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = tcp.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn relay_pipeline(seed: u64) -> NegotiationPipeline {
    crypto_pipeline(seed).with_step(SharedSecretGateStep::new("tunnel"))
}

#[tokio::test]
async fn test_ping_through_relay() {
    let target = echo_server().await;
    let exit = TcpRelay::init_exit(ExitConfig::new(
        RelayTarget::fixed(LOCALHOST, target.port()),
        relay_pipeline(10),
    ))
    .await
    .unwrap();
    let entry = TcpRelay::init_entry(EntryConfig::new(LOCALHOST, exit.local_addr().port(), relay_pipeline(11)))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(10), async {
        let mut app = TcpStream::connect(entry.local_addr()).await.unwrap();
        app.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 4];
        app.read_exact(&mut reply).await.unwrap();
        reply
    })
    .await
    .expect("no echo within bounded time");
    assert_eq!(&reply, b"ping");

    entry.shutdown().await;
    exit.shutdown().await;
}

#[tokio::test]
async fn test_relay_from_config_forwards_large_payload() {
    let target = echo_server().await;

    let mut exit_config = plain_config();
    exit_config.relay.listen_host = LOCALHOST.to_string();
    exit_config.relay.target_host = Some(LOCALHOST.to_string());
    exit_config.relay.target_port = Some(target.port());
    exit_config.shared_secret.password = Some("tunnel".to_string());
    let exit = TcpRelay::init_exit(ExitConfig::from_config(&exit_config).unwrap())
        .await
        .unwrap();

    let mut entry_config = plain_config();
    entry_config.relay.listen_host = LOCALHOST.to_string();
    entry_config.relay.exit_host = Some(LOCALHOST.to_string());
    entry_config.relay.exit_port = Some(exit.local_addr().port());
    entry_config.shared_secret.password = Some("tunnel".to_string());
    let entry = TcpRelay::init_entry(EntryConfig::from_config(&entry_config).unwrap())
        .await
        .unwrap();

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let echoed = tokio::time::timeout(Duration::from_secs(20), async {
        let app = TcpStream::connect(entry.local_addr()).await.unwrap();
        let (mut reader, mut writer) = app.into_split();
        let expected = payload.len();
        let send = payload.clone();
        let writer_task = tokio::spawn(async move {
            writer.write_all(&send).await.unwrap();
            writer
        });
        let mut echoed = vec![0u8; expected];
        reader.read_exact(&mut echoed).await.unwrap();
        drop(writer_task.await.unwrap());
        echoed
    })
    .await
    .unwrap();
    assert_eq!(echoed, payload);

    entry.shutdown().await;
    exit.shutdown().await;
}

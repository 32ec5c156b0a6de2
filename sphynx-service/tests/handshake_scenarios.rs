//! End-to-end scenarios driving a real `SphynxServer` over loopback UDP:
//! a normal handshake, a retransmitted CHALLENGE, and per-address flood
//! capping.

use std::time::Duration;

use sphynx_crypto::random::SecureRandom;
use sphynx_protocol::constants::HandshakeError;
use sphynx_protocol::handshake;
use sphynx_service::{Error, ServerEvent, SphynxClient, SphynxConfig, SphynxServer};
use tokio::net::UdpSocket;
use tokio::time::timeout;

async fn bind_server(config: SphynxConfig) -> (std::sync::Arc<SphynxServer>, tokio::sync::mpsc::UnboundedReceiver<ServerEvent>) {
    SphynxServer::bind("127.0.0.1:0".parse().unwrap(), config).await.unwrap()
}

#[tokio::test]
async fn happy_path_handshake_connects_client_and_server() {
    let (server, mut events) = bind_server(SphynxConfig::default()).await;
    let server_addr = server.local_addr().unwrap();
    let server_pub = server.public_key();

    let (_client, _client_events) = SphynxClient::connect(server_addr, server_pub, SphynxConfig::default()).await.unwrap();

    let event = timeout(Duration::from_secs(2), events.recv()).await.expect("server event in time").expect("server still running");
    assert!(matches!(event, ServerEvent::Connected(_)));
}

#[tokio::test]
async fn a_retransmitted_challenge_is_answered_from_cache_without_a_second_connexion() {
    let (server, mut events) = bind_server(SphynxConfig::default()).await;
    let server_addr = server.local_addr().unwrap();
    let server_pub = server.public_key();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server_addr).await.unwrap();

    let hello = handshake::encode_hello(&server_pub);
    socket.send(&hello).await.unwrap();
    let mut buf = vec![0u8; 2048];
    let len = socket.recv(&mut buf).await.unwrap();
    let cookie = handshake::decode_cookie(&buf[..len]).unwrap();

    let mut rng = SecureRandom::new();
    let (_a, big_a) = handshake::client_begin(&mut rng);
    let challenge = handshake::encode_challenge(cookie, &big_a);

    socket.send(&challenge).await.unwrap();
    let len = socket.recv(&mut buf).await.unwrap();
    let first_answer = buf[..len].to_vec();

    // Retransmit the byte-identical CHALLENGE, as a client would after
    // losing the first ANSWER.
    socket.send(&challenge).await.unwrap();
    let len = socket.recv(&mut buf).await.unwrap();
    let second_answer = buf[..len].to_vec();

    assert_eq!(first_answer, second_answer, "retransmission must get the cached ANSWER verbatim");

    let event = timeout(Duration::from_secs(2), events.recv()).await.expect("server event in time").expect("server still running");
    assert!(matches!(event, ServerEvent::Connected(_)));

    // The retransmission must never produce a second `Connected` event.
    let second = timeout(Duration::from_millis(200), events.recv()).await;
    assert!(second.is_err(), "retransmitted challenge must not create a second connexion");
}

#[tokio::test]
async fn flood_cap_rejects_connections_past_the_threshold_from_one_address() {
    let mut config = SphynxConfig::default();
    config.connection_flood_threshold = 2;
    config.hash_table_size = 16;
    config.flood_table_size = 16;

    let (server, _events) = bind_server(config.clone()).await;
    let server_addr = server.local_addr().unwrap();
    let server_pub = server.public_key();

    for _ in 0..2 {
        SphynxClient::connect(server_addr, server_pub, config.clone()).await.expect("under the flood threshold");
    }

    let result = SphynxClient::connect(server_addr, server_pub, config.clone()).await;
    match result {
        Err(Error::Protocol(sphynx_protocol::Error::Handshake(reason))) => {
            assert_eq!(reason, HandshakeError::ServerFull);
        }
        other => panic!("expected a server-full handshake rejection, got {other:?}"),
    }
}

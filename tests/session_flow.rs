//! End-to-end tests over loopback TCP: lobby handshake, redirect to login,
//! join, throttle disconnect and receive buffer overflow.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use tiered_netcore::core::codec::FrameCodec;
use tiered_netcore::protocol::handshake::{
    client_op, install_lobby, server_op, system_message, ClientJoin, RedirectTicket, ServerTable,
};
use tiered_netcore::utils::crypto::{Cipher, KeyTable};
use tiered_netcore::{ConnectionRegistry, Frame, Listener, ProtocolTier, Tier, ThrottleRule};

const WAIT: Duration = Duration::from_secs(5);

type Client = Framed<TcpStream, FrameCodec>;

async fn serve(tier: Arc<Tier>, registry: &Arc<ConnectionRegistry>, stop: &CancellationToken) -> SocketAddr {
    let listener = Listener::bind("127.0.0.1:0", tier, Arc::clone(registry), stop.clone())
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    listener.spawn();
    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let stream = TcpStream::connect(addr).await.unwrap();
    Framed::new(stream, FrameCodec::client())
}

async fn next_frame(client: &mut Client) -> Frame {
    timeout(WAIT, client.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection closed")
        .expect("undecodable frame")
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

fn seal(cipher: &Cipher, frame: Frame, ordinal: u8) -> Frame {
    cipher.seal(&frame, ordinal, &mut rand::rng()).unwrap()
}

#[tokio::test]
async fn test_lobby_to_login_handoff() {
    let registry = ConnectionRegistry::new();
    let stop = CancellationToken::new();

    let login = Tier::builder(ProtocolTier::Login)
        .redirect_delay(Duration::ZERO)
        .handler(client_op::JOIN, |session, _| {
            let name = session.name().unwrap_or_default();
            Ok(vec![system_message(0, &format!("welcome {name}"))])
        })
        .build();
    let login_addr = serve(Arc::clone(&login), &registry, &stop).await;

    let table = Arc::new(ServerTable {
        crc: 0x1234_5678,
        data: vec![1, 2, 3],
    });
    let lobby = install_lobby(Tier::builder(ProtocolTier::Lobby), login, table).build();
    let lobby_addr = serve(lobby, &registry, &stop).await;

    // lobby: welcome, version, server table request
    let mut client = connect(lobby_addr).await;
    let welcome = next_frame(&mut client).await;
    assert_eq!(welcome.opcode, server_op::WELCOME);

    client
        .send(Frame::client(client_op::VERSION, vec![0x02, 0xC1]))
        .await
        .unwrap();
    let params = next_frame(&mut client).await;
    assert_eq!(params.opcode, server_op::CRYPTO_PARAMS);
    assert_eq!(&params.payload[1..5], &0x1234_5678u32.to_be_bytes());

    let lobby_cipher = Cipher::lobby_default();
    client
        .send(seal(
            &lobby_cipher,
            Frame::client(client_op::REQUEST_SERVER_TABLE, vec![0]),
            0,
        ))
        .await
        .unwrap();
    let redirect = next_frame(&mut client).await;
    assert_eq!(redirect.opcode, server_op::REDIRECT);
    let ticket = RedirectTicket::parse(&redirect).unwrap();
    assert_eq!(ticket.port, login_addr.port());
    assert_eq!(registry.pending_redirects(), 1);

    // login: join with the ticket's credentials
    let mut login_client = connect(SocketAddr::from((ticket.address, ticket.port))).await;
    login_client
        .send(ClientJoin::from_ticket(&ticket).to_frame())
        .await
        .unwrap();

    let reply = next_frame(&mut login_client).await;
    assert_eq!(reply.opcode, server_op::SYSTEM_MESSAGE);
    let session_cipher = Cipher::new(ticket.seed, ticket.key.clone())
        .unwrap()
        .with_key_table(KeyTable::generate(&ticket.name));
    let opened = session_cipher.open(&reply).unwrap();
    let text_len = u16::from_be_bytes([opened.payload[1], opened.payload[2]]) as usize;
    assert_eq!(&opened.payload[3..3 + text_len], b"welcome socket");

    assert_eq!(registry.pending_redirects(), 0);
    assert_eq!(registry.metrics().snapshot().redirects_consumed, 1);

    stop.cancel();
}

#[tokio::test]
async fn test_replayed_join_is_not_authenticated() {
    let registry = ConnectionRegistry::new();
    let stop = CancellationToken::new();

    let login = Tier::builder(ProtocolTier::Login)
        .redirect_delay(Duration::ZERO)
        .build();
    let login_addr = serve(Arc::clone(&login), &registry, &stop).await;
    let lobby = install_lobby(
        Tier::builder(ProtocolTier::Lobby),
        Arc::clone(&login),
        Arc::new(ServerTable::default()),
    )
    .build();
    let lobby_addr = serve(lobby, &registry, &stop).await;

    let mut client = connect(lobby_addr).await;
    next_frame(&mut client).await;
    client
        .send(seal(
            &Cipher::lobby_default(),
            Frame::client(client_op::REQUEST_SERVER_TABLE, vec![0]),
            0,
        ))
        .await
        .unwrap();
    let ticket = RedirectTicket::parse(&next_frame(&mut client).await).unwrap();
    let join = ClientJoin::from_ticket(&ticket).to_frame();

    let mut first = connect(login_addr).await;
    first.send(join.clone()).await.unwrap();
    wait_until(|| registry.metrics().snapshot().redirects_consumed == 1).await;

    let mut second = connect(login_addr).await;
    second.send(join).await.unwrap();
    wait_until(|| login.client_count() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let authenticated = login
        .clients()
        .iter()
        .filter(|session| session.is_authenticated())
        .count();
    assert_eq!(authenticated, 1);
    assert_eq!(registry.metrics().snapshot().redirects_consumed, 1);

    stop.cancel();
}

#[tokio::test]
async fn test_throttle_abuse_disconnects_client() {
    let registry = ConnectionRegistry::new();
    let stop = CancellationToken::new();

    let tier = Tier::builder(ProtocolTier::Login)
        .default_cipher(Cipher::lobby_default())
        .throttle(ThrottleRule::new(
            0x03,
            Duration::from_millis(500),
            Duration::ZERO,
            3,
        ))
        .handler(0x03, |_, _| Ok(Vec::new()))
        .build();
    let addr = serve(tier, &registry, &stop).await;

    let cipher = Cipher::lobby_default();
    let mut client = connect(addr).await;
    for ordinal in 0..6u8 {
        client
            .feed(seal(&cipher, Frame::client(0x03, vec![ordinal]), ordinal))
            .await
            .unwrap();
    }
    client.flush().await.unwrap();

    let notice = next_frame(&mut client).await;
    assert_eq!(notice.opcode, server_op::SYSTEM_MESSAGE);
    let opened = cipher.open(&notice).unwrap();
    assert_eq!(opened.payload[0], 3);

    let eof = timeout(WAIT, client.next()).await.expect("server kept the connection open");
    assert!(eof.is_none());

    let metrics = registry.metrics().snapshot();
    assert_eq!(metrics.abuse_disconnects, 1);
    assert_eq!(metrics.frames_throttled, 3);
    wait_until(|| registry.counts().0 == 0).await;

    stop.cancel();
}

#[tokio::test]
async fn test_oversized_stream_is_a_framing_fault() {
    let registry = ConnectionRegistry::new();
    let stop = CancellationToken::new();
    let tier = Tier::builder(ProtocolTier::Login).build();
    let addr = serve(tier, &registry, &stop).await;

    let mut bytes = vec![0u8; 70_000];
    bytes[..3].copy_from_slice(&[0xAA, 0xFF, 0xFF]);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    // the server may reset the connection before everything is written
    let _ = stream.write_all(&bytes).await;

    wait_until(|| registry.metrics().snapshot().framing_faults == 1).await;
    wait_until(|| registry.counts().0 == 0).await;

    stop.cancel();
}

#[tokio::test]
async fn test_stop_token_drains_clients() {
    let registry = ConnectionRegistry::new();
    let stop = CancellationToken::new();
    let tier = Tier::builder(ProtocolTier::Login)
        .welcome(Frame::server(server_op::WELCOME, vec![0x1B]))
        .build();
    let listener = Listener::bind("127.0.0.1:0", Arc::clone(&tier), Arc::clone(&registry), stop.clone())
        .await
        .unwrap()
        .with_shutdown_timeout(Duration::from_secs(1));
    let addr = listener.local_addr().unwrap();
    let handle = listener.spawn();

    let mut client = connect(addr).await;
    next_frame(&mut client).await;
    wait_until(|| tier.client_count() == 1).await;

    stop.cancel();
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

    let eof = timeout(WAIT, client.next()).await.unwrap();
    assert!(eof.is_none());
    assert_eq!(registry.counts().0, 0);
}

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary conditions of framing, handoff and session teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

use tiered_netcore::core::codec::FrameCodec;
use tiered_netcore::core::packet::{peek_frame_len, MAX_BODY_LEN};
use tiered_netcore::protocol::handshake::{client_op, ClientJoin, RedirectTicket};
use tiered_netcore::protocol::message::{work_queue, ControlOpcode, WorkItem};
use tiered_netcore::transport::connection::ConnectionState;
use tiered_netcore::{
    ConnectionRegistry, DisconnectReason, Frame, ProtocolError, ProtocolTier, Session, Tier,
};

fn peer() -> SocketAddr {
    "127.0.0.1:45000".parse().unwrap()
}

fn session_on(tier: &Arc<Tier>, registry: &Arc<ConnectionRegistry>) -> Arc<Session> {
    let session = Session::new(
        registry.next_connection_id(),
        Arc::clone(tier),
        Arc::clone(registry),
        peer(),
        None,
        CancellationToken::new(),
    );
    registry.register_session(Arc::clone(&session));
    tier.add_client(Arc::clone(&session));
    session
}

// ============================================================================
// FRAMING
// ============================================================================

#[test]
fn test_oversized_receive_is_rejected() {
    let registry = ConnectionRegistry::new();
    let tier = Tier::builder(ProtocolTier::Login).build();
    let session = session_on(&tier, &registry);

    let mut bytes = vec![0u8; 70_000];
    bytes[..3].copy_from_slice(&[0xAA, 0xFF, 0xFF]);

    // the declared frame fits; what follows it is not a frame
    match session.receive_bytes(&bytes) {
        Err(err) => assert!(err.is_framing_fault(), "unexpected error: {err:?}"),
        Ok(()) => panic!("70000 bytes of garbage were accepted"),
    }
    let conn = session.connection();
    assert!(conn.buffered_len() <= conn.capacity());
}

#[test]
fn test_pipelined_frames_past_capacity_are_delivered() {
    let registry = ConnectionRegistry::new();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let tier = Tier::builder(ProtocolTier::Login)
        .handler(client_op::VERSION, move |_, frame| {
            sink.lock().unwrap().push(frame.payload.len());
            Ok(Vec::new())
        })
        .build();
    let session = session_on(&tier, &registry);

    let mut bytes = Frame::client(client_op::VERSION, vec![1; MAX_BODY_LEN - 1])
        .to_bytes()
        .unwrap();
    bytes.extend(Frame::client(client_op::VERSION, vec![2; 4_000]).to_bytes().unwrap());

    for chunk in bytes.chunks(4096) {
        session.receive_bytes(chunk).unwrap();
    }
    assert_eq!(*seen.lock().unwrap(), vec![MAX_BODY_LEN - 1, 4_000]);
    assert_eq!(registry.metrics().snapshot().frames_received, 2);
}

#[test]
fn test_largest_frame_fits_default_capacity() {
    let frame = Frame::client(0x00, vec![0x5A; MAX_BODY_LEN - 1]);
    let bytes = frame.to_bytes().unwrap();
    assert_eq!(bytes.len(), MAX_BODY_LEN + 3);

    let conn = ConnectionState::new(1, tiered_netcore::core::codec::DEFAULT_CAPACITY);
    conn.append_received(&bytes).unwrap();
    assert_eq!(conn.extract_frames().unwrap(), 1);
    assert_eq!(conn.pop_inbound().unwrap().payload.len(), MAX_BODY_LEN - 1);
}

#[test]
fn test_body_too_large_for_length_field() {
    let frame = Frame::client(0x00, vec![0; MAX_BODY_LEN]);
    assert!(matches!(
        frame.to_bytes(),
        Err(ProtocolError::OversizedFrame(_))
    ));
}

#[test]
fn test_bad_sentinel_is_a_framing_fault() {
    let registry = ConnectionRegistry::new();
    let tier = Tier::builder(ProtocolTier::Login).build();
    let session = session_on(&tier, &registry);

    let err = session.receive_bytes(&[0xAB, 0x00, 0x01, 0x00]).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidSentinel(0xAB)));
}

#[test]
fn test_header_only_frame_is_malformed() {
    let mut codec = FrameCodec::server();
    let mut buf = BytesMut::from(&[0xAA, 0x00, 0x00][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ProtocolError::MalformedFrame(_))
    ));
}

#[test]
fn test_encrypted_frame_needs_ordinal() {
    // client 0x03 is encrypted, so one body byte is not enough
    assert!(matches!(
        Frame::from_bytes(&[0xAA, 0x00, 0x01, 0x03], tiered_netcore::Direction::Client),
        Err(ProtocolError::MalformedFrame(_))
    ));
}

#[test]
fn test_peek_waits_for_full_header() {
    assert_eq!(peek_frame_len(&[]).unwrap(), None);
    assert_eq!(peek_frame_len(&[0xAA, 0x00]).unwrap(), None);
    assert_eq!(peek_frame_len(&[0xAA, 0x00, 0x05]).unwrap(), Some(8));
}

#[test]
fn test_byte_at_a_time_delivery() {
    let registry = ConnectionRegistry::new();
    let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let tier = Tier::builder(ProtocolTier::Login)
        .handler(client_op::VERSION, move |_, frame| {
            assert_eq!(frame.payload, vec![0x02, 0xC1]);
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(Vec::new())
        })
        .build();
    let session = session_on(&tier, &registry);

    let bytes = Frame::client(client_op::VERSION, vec![0x02, 0xC1])
        .to_bytes()
        .unwrap();
    for byte in &bytes {
        session.receive_bytes(std::slice::from_ref(byte)).unwrap();
    }
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(registry.metrics().snapshot().frames_received, 1);
}

// ============================================================================
// HANDOFF
// ============================================================================

#[test]
fn test_join_on_lobby_is_not_intercepted() {
    let registry = ConnectionRegistry::new();
    let lobby = Tier::builder(ProtocolTier::Lobby).build();
    let session = session_on(&lobby, &registry);

    let join = ClientJoin {
        seed: 0,
        key: b"UrkcnItnI".to_vec(),
        name: "socket".into(),
        redirect_id: 1,
    };
    session.enqueue_inbound(join.to_frame());

    assert!(!session.is_authenticated());
    assert!(session.is_connected());
}

#[test]
fn test_unknown_redirect_id_is_rejected() {
    let registry = ConnectionRegistry::new();
    let login = Tier::builder(ProtocolTier::Login).build();
    let session = session_on(&login, &registry);

    let join = ClientJoin {
        seed: 0,
        key: b"UrkcnItnI".to_vec(),
        name: "socket".into(),
        redirect_id: 4242,
    };
    session.enqueue_inbound(join.to_frame());
    assert!(!session.is_authenticated());
    assert_eq!(registry.metrics().snapshot().redirects_consumed, 0);
}

#[test]
fn test_truncated_join_does_not_disconnect() {
    let registry = ConnectionRegistry::new();
    let login = Tier::builder(ProtocolTier::Login).build();
    let session = session_on(&login, &registry);

    session.enqueue_inbound(Frame::client(client_op::JOIN, vec![0, 9]));
    assert!(session.is_connected());
    assert!(!session.is_authenticated());
}

#[test]
fn test_origin_disconnect_keeps_redirect_claimable() {
    let registry = ConnectionRegistry::new();
    let lobby = Tier::builder(ProtocolTier::Lobby).build();
    let login = Tier::builder(ProtocolTier::Login).build();
    login.set_local_addr("127.0.0.1:2611".parse().unwrap());

    let origin = session_on(&lobby, &registry);
    origin.redirect(&login, "socket").unwrap();
    let ticket = RedirectTicket::parse(&origin.connection().pop_outbound().unwrap()).unwrap();
    origin.disconnect(DisconnectReason::ClientClosed);
    assert!(registry.has_redirect_from(origin.id()));

    let joiner = session_on(&login, &registry);
    joiner
        .handle_join(&ClientJoin::from_ticket(&ticket).to_frame())
        .unwrap();
    assert!(joiner.is_authenticated());
    assert!(!registry.has_redirect_from(origin.id()));
}

// ============================================================================
// TEARDOWN
// ============================================================================

#[test]
fn test_disconnected_session_ignores_input_and_output() {
    let registry = ConnectionRegistry::new();
    let login = Tier::builder(ProtocolTier::Login)
        .handler(client_op::VERSION, |_, _| panic!("must not run"))
        .build();
    let session = session_on(&login, &registry);

    assert!(session.disconnect(DisconnectReason::Requested));
    session.enqueue_inbound(Frame::client(client_op::VERSION, vec![]));
    session.enqueue(Frame::server(0x7E, vec![]));

    assert!(!session.connection().has_pending_outbound());
    assert_eq!(registry.metrics().snapshot().handler_faults, 0);
    assert_eq!(session.close_reason(), None);
}

#[test]
fn test_world_disconnect_announces_cleanup_once() {
    let (queue, mut rx) = work_queue();
    let registry = ConnectionRegistry::with_work_queue(queue.clone());
    let world = Tier::builder(ProtocolTier::World).work_queue(queue).build();
    let session = session_on(&world, &registry);

    session.disconnect(DisconnectReason::TransportError);
    session.disconnect(DisconnectReason::TransportError);

    let cleanups = std::iter::from_fn(|| rx.try_recv())
        .filter(|item| {
            matches!(item, WorkItem::Control(msg)
                if msg.opcode == ControlOpcode::CleanupUser
                    && msg.connection_id() == Some(session.id()))
        })
        .count();
    assert_eq!(cleanups, 1);
}

#[tokio::test]
async fn test_closed_resolves_after_disconnect() {
    let registry = ConnectionRegistry::new();
    let login = Tier::builder(ProtocolTier::Login).build();
    let session = session_on(&login, &registry);

    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.closed().await })
    };
    session.disconnect(DisconnectReason::Requested);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}

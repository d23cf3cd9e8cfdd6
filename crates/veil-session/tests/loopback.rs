//! End-to-end session tests over loopback TCP.
//!
//! Every test stands up a real acceptor (with a small test keypair so RSA
//! generation stays fast), connects a client session through the full
//! handshake, and exercises the packet pipeline both ways.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use veil_crypto::os_random;
use veil_session::{packet_type, Packet, PacketBuffer, PacketFlags, Session};
use veil_transport::{Acceptor, AcceptorConfig, SecureTransport, SessionHandler};

/// User packet types used by these tests.
const T_BULK: u16 = 100;
const T_CLEARABLE: u16 = 101;
const T_HEADER_ONLY: u16 = 102;
const T_UNUSED: u16 = 142;

fn test_config() -> AcceptorConfig {
    AcceptorConfig {
        key_bits: 1024,
        no_delay: true,
    }
}

/// Poll `cond` every few milliseconds until it holds or `timeout` passes.
fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Bind an acceptor on an ephemeral port, serve exactly one connection with
/// `handler`, and return the port.
fn serve_one(handler: SessionHandler) -> u16 {
    let acceptor = Acceptor::bind("127.0.0.1:0", handler, None, os_random(), test_config())
        .expect("bind acceptor");
    let port = acceptor.local_addr().expect("local addr").port();
    std::thread::spawn(move || {
        acceptor.accept_one().expect("accept");
    });
    port
}

/// An echo server: every `PING` body comes back as `PING_REPLY`, every
/// `T_BULK` body as `T_BULK`.
fn echo_handler(crypto_parallelism: usize) -> SessionHandler {
    Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Arc::new(Session::new(transport, crypto_parallelism));
        let weak = Arc::downgrade(&session);
        session.on_recv(packet_type::PING, move |packet: Packet, received: u64| {
            if received < packet.header.size {
                return;
            }
            if let Some(session) = weak.upgrade() {
                session.push(packet_type::PING_REPLY, PacketFlags::new(), packet.buffer);
            }
        });
        let weak = Arc::downgrade(&session);
        session.on_recv(T_BULK, move |packet: Packet, received: u64| {
            if received < packet.header.size {
                return;
            }
            if let Some(session) = weak.upgrade() {
                session.push(T_BULK, PacketFlags::new(), packet.buffer);
            }
        });
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(10));
        }
    })
}

fn connect_client(port: u16, crypto_parallelism: usize) -> Session {
    let transport = Arc::new(SecureTransport::new(os_random()));
    let session = Session::new(transport, crypto_parallelism);
    session
        .connect("127.0.0.1", port, true)
        .expect("client connect");
    session
}

#[test]
fn loopback_echo() {
    let port = serve_one(echo_handler(0));
    let session = connect_client(port, 0);
    assert!(session.is_connected());
    assert!(session.transport().is_secure());

    session.push(
        packet_type::PING,
        PacketFlags::new(),
        Some(PacketBuffer::from_slice(b"hello")),
    );
    let reply = session.pull(packet_type::PING_REPLY);
    assert_eq!(reply.header.packet_type, packet_type::PING_REPLY);
    assert_eq!(reply.header.size, 5);
    assert_eq!(&reply.buffer.expect("echo body").to_vec()[..5], b"hello");
}

#[test]
fn handshake_magic_mismatch_fails_connect() {
    // A fake server that speaks the right shapes with the wrong magic.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        use std::io::Write;
        let (mut stream, _) = listener.accept().unwrap();
        let mut hello = [0u8; 40];
        hello[..16].copy_from_slice(b"NOT-VEIL-AT-ALL\0");
        hello[16..18].copy_from_slice(&32u16.to_le_bytes());
        hello[18..20].copy_from_slice(&64u16.to_le_bytes());
        let _ = stream.write_all(&hello);
        // Hold the socket open; the client must bail on its own.
        std::thread::sleep(Duration::from_millis(500));
    });

    let transport = Arc::new(SecureTransport::new(os_random()));
    let session = Session::new(transport, 0);
    let result = session.connect("127.0.0.1", port, false);
    assert!(result.is_err());
    assert!(!session.is_connected());
}

#[test]
fn remove_previous_drains_the_type_queue() {
    let handler: SessionHandler = Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Session::new(transport, 0);
        session.push(
            T_BULK,
            PacketFlags::new(),
            Some(PacketBuffer::from_slice(&[0x01])),
        );
        session.push(
            T_BULK,
            PacketFlags::new().with_remove_previous(),
            Some(PacketBuffer::from_slice(&[0x02])),
        );
        session.push(
            T_BULK,
            PacketFlags::new(),
            Some(PacketBuffer::from_slice(&[0x03])),
        );
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    let port = serve_one(handler);
    let session = connect_client(port, 0);

    assert!(
        wait_until(Duration::from_secs(5), || session.pullable(T_BULK) == 2),
        "expected the REMOVE_PREVIOUS packet to displace its predecessor"
    );
    let first = session.pull(T_BULK);
    assert_eq!(first.buffer.expect("body").to_vec(), vec![0x02]);
    assert!(first.header.flags.removes_previous());
    let second = session.pull(T_BULK);
    assert_eq!(second.buffer.expect("body").to_vec(), vec![0x03]);
}

#[test]
fn keep_alive_is_answered_automatically() {
    let handler: SessionHandler = Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Session::new(transport, 0);
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    let port = serve_one(handler);
    let session = connect_client(port, 0);

    assert_eq!(session.pullable(packet_type::KEEP_ALIVE_REPLY), 0);
    session.push(packet_type::KEEP_ALIVE_REQUEST, PacketFlags::new(), None);
    assert!(
        wait_until(Duration::from_secs(5), || {
            session.pullable(packet_type::KEEP_ALIVE_REPLY) == 1
        }),
        "peer did not auto-answer the keep-alive"
    );
    let reply = session.pull(packet_type::KEEP_ALIVE_REPLY);
    assert_eq!(reply.header.size, 0);
    assert!(reply.buffer.is_none());
}

#[test]
fn disconnect_unblocks_pull() {
    let port = serve_one(echo_handler(0));
    let session = Arc::new(connect_client(port, 0));

    let (tx, rx) = mpsc::channel();
    let puller = Arc::clone(&session);
    std::thread::spawn(move || {
        let packet = puller.pull(T_UNUSED);
        tx.send(packet).unwrap();
    });

    std::thread::sleep(Duration::from_millis(50));
    session.disconnect();

    let packet = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("pull did not unblock after disconnect");
    assert_eq!(packet.header.packet_type, packet_type::UNDEFINED);
    assert!(packet.buffer.is_none());
}

#[test]
fn push_order_and_ids_are_preserved() {
    let port = serve_one(echo_handler(0));
    let session = connect_client(port, 0);

    let mut last_id = 0;
    for i in 0..20u8 {
        let id = session.push(
            T_BULK,
            PacketFlags::new(),
            Some(PacketBuffer::from_slice(&[i])),
        );
        assert!(id > last_id, "ids must be strictly monotonic");
        last_id = id;
    }

    for i in 0..20u8 {
        let packet = session.pull(T_BULK);
        assert_eq!(
            packet.buffer.expect("body").to_vec(),
            vec![i],
            "echoes arrived out of push order"
        );
    }
}

#[test]
fn wait_blocks_until_sent_and_callback_reports_bytes() {
    let port = serve_one(echo_handler(0));
    let session = connect_client(port, 0);

    let (tx, rx) = mpsc::channel();
    session.on_sent(packet_type::PING, move |id, bytes| {
        tx.send((id, bytes)).unwrap();
    });

    let id = session.push(
        packet_type::PING,
        PacketFlags::new(),
        Some(PacketBuffer::from_slice(b"probe")),
    );
    session.wait(id);

    let (sent_id, bytes) = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("sent-callback never fired");
    assert_eq!(sent_id, id);
    assert_eq!(bytes, 5);
}

#[test]
fn clear_empties_every_receive_queue() {
    let handler: SessionHandler = Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Session::new(transport, 0);
        for i in 0..5u8 {
            session.push(
                T_CLEARABLE,
                PacketFlags::new(),
                Some(PacketBuffer::from_slice(&[i])),
            );
        }
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    let port = serve_one(handler);
    let session = connect_client(port, 0);

    assert!(wait_until(Duration::from_secs(5), || {
        session.pullable(T_CLEARABLE) == 5
    }));
    assert_eq!(session.types_pullable(), vec![T_CLEARABLE]);

    session.clear();
    assert_eq!(session.pullable(T_CLEARABLE), 0);
    assert_eq!(session.pullable(packet_type::UNDEFINED), 0);
    assert!(session.types_pullable().is_empty());
}

#[test]
fn header_only_packets_round_trip() {
    let handler: SessionHandler = Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Session::new(transport, 0);
        session.push(T_HEADER_ONLY, PacketFlags::new(), None);
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    let port = serve_one(handler);
    let session = connect_client(port, 0);

    let packet = session.pull(T_HEADER_ONLY);
    assert_eq!(packet.header.packet_type, T_HEADER_ONLY);
    assert_eq!(packet.header.size, 0);
    assert!(packet.buffer.is_none());
}

#[test]
fn parallel_crypto_round_trips_bulk_payloads() {
    let port = serve_one(echo_handler(2));
    let session = connect_client(port, 2);

    let payload: Vec<u8> = (0..100_000usize).map(|i| (i % 239) as u8).collect();
    session.push(
        T_BULK,
        PacketFlags::new(),
        Some(PacketBuffer::from_slice(&payload)),
    );

    let echoed = session.pull(T_BULK);
    assert_eq!(echoed.header.size as usize, payload.len());
    assert_eq!(&echoed.buffer.expect("body").to_vec()[..payload.len()], &payload[..]);
}

#[test]
fn pull_undefined_returns_any_queued_packet() {
    let handler: SessionHandler = Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Session::new(transport, 0);
        session.push(
            T_BULK,
            PacketFlags::new(),
            Some(PacketBuffer::from_slice(b"x")),
        );
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(10));
        }
    });
    let port = serve_one(handler);
    let session = connect_client(port, 0);

    let packet = session.pull(packet_type::UNDEFINED);
    assert_eq!(packet.header.packet_type, T_BULK);
}

#[test]
fn session_drop_quiesces_cleanly_mid_traffic() {
    let stopped = Arc::new(AtomicBool::new(false));
    let observed = Arc::clone(&stopped);
    let handler: SessionHandler = Arc::new(move |transport: Arc<SecureTransport>| {
        let session = Session::new(transport, 2);
        while session.is_connected() {
            std::thread::sleep(Duration::from_millis(5));
        }
        observed.store(true, Ordering::Release);
    });
    let port = serve_one(handler);

    {
        let session = connect_client(port, 2);
        for i in 0..10u8 {
            session.push(
                T_BULK,
                PacketFlags::new(),
                Some(PacketBuffer::from_slice(&[i; 4096])),
            );
        }
        // Drop while the pipeline may still be mid-flight.
    }

    assert!(
        wait_until(Duration::from_secs(5), || stopped.load(Ordering::Acquire)),
        "server session never observed the disconnect"
    );
}

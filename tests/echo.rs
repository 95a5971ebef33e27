use std::sync::{Arc, Mutex};
use std::time::Duration;

use rstest::rstest;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use stonenet::{
    Engine, EngineConfig, FrameKind, NetClient, NetEvents, NetServer, SessionUid, HEADER_SIZE,
};

/// Records every callback in arrival order; optionally echoes frames back.
#[derive(Clone, Default)]
struct Recorder {
    echo: bool,
    veto: bool,
    seen: Arc<Mutex<Vec<Seen>>>,
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Join(SessionUid),
    Frame(SessionUid, Vec<u8>),
    Leave(SessionUid),
}

impl Recorder {
    fn echoing() -> Recorder {
        Recorder {
            echo: true,
            ..Recorder::default()
        }
    }

    fn vetoing() -> Recorder {
        Recorder {
            veto: true,
            ..Recorder::default()
        }
    }

    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    async fn wait_until(&self, what: &str, predicate: impl Fn(&[Seen]) -> bool) {
        for _ in 0..1_000 {
            if predicate(&self.seen()) {
                return;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}; events so far: {:?}", self.seen());
    }

    async fn wait_join(&self) -> SessionUid {
        self.wait_until("a session join", |seen| {
            seen.iter().any(|s| matches!(s, Seen::Join(_)))
        })
        .await;
        self.seen()
            .iter()
            .find_map(|s| match s {
                Seen::Join(uid) => Some(*uid),
                _ => None,
            })
            .unwrap()
    }

    fn frames(&self) -> Vec<Vec<u8>> {
        self.seen()
            .iter()
            .filter_map(|s| match s {
                Seen::Frame(_, payload) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

impl NetEvents for Recorder {
    fn on_connection_request(&self, _peer: std::net::SocketAddr) -> bool {
        !self.veto
    }

    fn on_client_join(&self, session: SessionUid) {
        self.seen.lock().unwrap().push(Seen::Join(session));
    }

    fn on_recv(&self, engine: &dyn Engine, session: SessionUid, frame: &stonenet::Message) {
        if self.echo {
            assert!(engine.send(session, frame.payload()));
        }
        self.seen
            .lock()
            .unwrap()
            .push(Seen::Frame(session, frame.payload().to_vec()));
    }

    fn on_client_leave(&self, session: SessionUid) {
        self.seen.lock().unwrap().push(Seen::Leave(session));
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.network.ip = "127.0.0.1".to_string();
    config.network.port = 0;
    config.network.max_sessions = 8;
    config.workers.worker_tasks = 2;
    config.workers.send_flush_interval_ms = 1;
    config.workers.shutdown_timeout_ms = 2_000;
    config.buffers.ring_capacity = 4096;
    config.buffers.message_pool_capacity = 16;
    config.buffers.local_pool_chunk = 4;
    config
}

fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    bytes.extend_from_slice(&(FrameKind::User as i16).to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

async fn read_frame(stream: &mut TcpStream) -> (i16, Vec<u8>) {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.unwrap();
    let kind = i16::from_le_bytes([header[0], header[1]]);
    let len = u16::from_le_bytes([header[2], header[3]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    (kind, payload)
}

#[tokio::test]
async fn echo_round_trip() {
    let recorder = Recorder::echoing();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    peer.write_all(&encode_frame(b"abcdefghij")).await.unwrap();

    let (kind, payload) = read_frame(&mut peer).await;
    assert_eq!(FrameKind::from_raw(kind), Some(FrameKind::User));
    assert_eq!(payload, b"abcdefghij");

    server.shutdown().await;
}

#[tokio::test]
async fn buffered_frame_is_delivered_before_leave_on_abrupt_close() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let payload = vec![0x5A; 37];
    {
        let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
        peer.write_all(&encode_frame(&payload)).await.unwrap();
        // socket drops here: data then FIN
    }

    recorder
        .wait_until("the session to leave", |seen| {
            seen.iter().any(|s| matches!(s, Seen::Leave(_)))
        })
        .await;

    let seen = recorder.seen();
    let frame_at = seen
        .iter()
        .position(|s| matches!(s, Seen::Frame(_, p) if p == &payload))
        .expect("the 37-byte frame must still be delivered");
    let leave_at = seen
        .iter()
        .position(|s| matches!(s, Seen::Leave(_)))
        .unwrap();
    assert!(frame_at < leave_at);

    server.shutdown().await;
}

#[tokio::test]
async fn back_to_back_sends_arrive_as_two_frames() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    let uid = recorder.wait_join().await;

    assert!(server.send(uid, b"fives"));
    assert!(server.send(uid, b"sevens7"));

    let (_, first) = read_frame(&mut peer).await;
    let (_, second) = read_frame(&mut peer).await;
    assert_eq!(first, b"fives");
    assert_eq!(second, b"sevens7");

    server.shutdown().await;
}

#[tokio::test]
async fn send_message_carries_the_frame_kind() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    let uid = recorder.wait_join().await;

    let mut message = server.allocate_message();
    message.set_kind(FrameKind::System);
    assert!(message.put(b"sys"));
    assert!(server.send_message(uid, message));

    let (kind, payload) = read_frame(&mut peer).await;
    assert_eq!(kind, FrameKind::System as i16);
    assert_eq!(payload, b"sys");

    server.shutdown().await;
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
#[case(9)]
#[tokio::test]
async fn chunked_delivery_reassembles_every_frame(#[case] chunks: usize) {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let payloads: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; i as usize * 7 + 1]).collect();
    let mut stream_bytes = Vec::new();
    for payload in &payloads {
        stream_bytes.extend_from_slice(&encode_frame(payload));
    }

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    let chunk_len = stream_bytes.len().div_ceil(chunks);
    for chunk in stream_bytes.chunks(chunk_len) {
        peer.write_all(chunk).await.unwrap();
        peer.flush().await.unwrap();
        time::sleep(Duration::from_millis(3)).await;
    }

    recorder
        .wait_until("all frames to arrive", |seen| {
            seen.iter().filter(|s| matches!(s, Seen::Frame(..))).count() == payloads.len()
        })
        .await;
    assert_eq!(recorder.frames(), payloads);

    server.shutdown().await;
}

#[tokio::test]
async fn oversized_declared_length_tears_the_session_down() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    recorder.wait_join().await;

    // ring capacity is 4096; a 65535-byte frame can never fit
    let mut poison = Vec::new();
    poison.extend_from_slice(&(FrameKind::User as i16).to_le_bytes());
    poison.extend_from_slice(&u16::MAX.to_le_bytes());
    poison.push(0);
    peer.write_all(&poison).await.unwrap();

    recorder
        .wait_until("the violating session to leave", |seen| {
            seen.iter().any(|s| matches!(s, Seen::Leave(_)))
        })
        .await;
    assert!(recorder.frames().is_empty());

    // the server side closed the socket
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn capacity_gate_refuses_the_excess_connection() {
    let mut config = test_config();
    config.network.max_sessions = 1;
    let recorder = Recorder::default();
    let server = NetServer::start(config, recorder.clone()).await.unwrap();

    let _first = TcpStream::connect(server.local_addr()).await.unwrap();
    recorder.wait_join().await;

    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(second.read(&mut buf).await.unwrap(), 0);

    let joins = recorder
        .seen()
        .iter()
        .filter(|s| matches!(s, Seen::Join(_)))
        .count();
    assert_eq!(joins, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn connection_gate_vetoes_before_any_session_exists() {
    let recorder = Recorder::vetoing();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    assert!(recorder.seen().is_empty());
    assert_eq!(server.active_sessions(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn stale_uid_is_refused_after_the_slot_drains() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let uid = {
        let _peer = TcpStream::connect(server.local_addr()).await.unwrap();
        recorder.wait_join().await
    };
    recorder
        .wait_until("the session to leave", |seen| {
            seen.iter().any(|s| matches!(s, Seen::Leave(_)))
        })
        .await;

    assert!(!server.send(uid, b"too late"));
    assert!(!server.disconnect(uid));

    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_flushes_queued_output_first() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    let uid = recorder.wait_join().await;

    assert!(server.send(uid, b"farewell"));
    assert!(server.disconnect(uid));

    let (_, payload) = read_frame(&mut peer).await;
    assert_eq!(payload, b"farewell");
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn client_engine_round_trip() {
    let server_recorder = Recorder::echoing();
    let server = NetServer::start(test_config(), server_recorder.clone())
        .await
        .unwrap();

    let mut client_config = test_config();
    client_config.network.port = server.local_addr().port();
    let client_recorder = Recorder::default();
    let client = NetClient::connect(client_config, client_recorder.clone())
        .await
        .unwrap();

    assert!(client.is_connected());
    assert_eq!(
        client.peer_addr().map(|addr| addr.port()),
        Some(server.local_addr().port())
    );
    assert!(client.send(b"ping"));
    client_recorder
        .wait_until("the echoed frame", |seen| {
            seen.iter().any(|s| matches!(s, Seen::Frame(_, p) if p == b"ping"))
        })
        .await;

    assert!(client.disconnect());
    client.closed().await;
    assert!(!client.is_connected());

    client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_releases_active_sessions() {
    let recorder = Recorder::default();
    let server = NetServer::start(test_config(), recorder.clone()).await.unwrap();

    let mut peer = TcpStream::connect(server.local_addr()).await.unwrap();
    recorder.wait_join().await;
    assert_eq!(server.active_sessions(), 1);

    server.shutdown().await;

    let seen = recorder.seen();
    assert!(seen.iter().any(|s| matches!(s, Seen::Leave(_))));
    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
}

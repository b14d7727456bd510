//! End-to-end hub sessions over loopback TCP.
//!
//! A minimal in-test client drives the real wire protocol: handshake via
//! `ClientHandshake`, AEAD-wrapped packets once ready, framed reads with the
//! production reader.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use glyphcast_core::crypto::DirectionCipher;
use glyphcast_core::protocol::control::{
    self, ClientCapabilities, ClientJoin, ErrorPacket, RemoteLog,
};
use glyphcast_core::protocol::media::{AudioBatch, ImageFrame, OpusBatch, OpusSingle};
use glyphcast_core::protocol::wire::{self, read_framed, ReadOutcome};
use glyphcast_core::{
    ClientHandshake, ClientHandshakeConfig, ClientId, ColorLevel, HandshakePhase, HostConfig, Hub,
    HubError, HubEvents, PacketType, RenderMode,
};

// ─────────────────────────────────────────────────────────────────────────────
// Test harness
// ─────────────────────────────────────────────────────────────────────────────

const MAX_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Event recorder for join/leave assertions.
#[derive(Default)]
struct CountingEvents {
    joins: AtomicUsize,
    leaves: AtomicUsize,
    errors: AtomicUsize,
}

impl HubEvents for CountingEvents {
    fn on_client_join(&self, _info: &glyphcast_core::ClientInfo) {
        self.joins.fetch_add(1, Ordering::SeqCst);
    }

    fn on_client_leave(&self, _client_id: ClientId) {
        self.leaves.fetch_add(1, Ordering::SeqCst);
    }

    fn on_frame_received(&self, _client_id: ClientId, _width: u32, _height: u32) {}

    fn on_audio_received(&self, _client_id: ClientId, _samples: usize) {}

    fn on_error(&self, _client_id: Option<ClientId>, _error: &HubError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates a hub bound to an OS-assigned free port and returns the address.
fn fixed_port_hub(config_tweak: impl FnOnce(&mut HostConfig)) -> (Hub, Arc<CountingEvents>, SocketAddr) {
    // Reserve a free port, release it, and hand it to the hub. The race
    // window is acceptable for loopback tests.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let events = Arc::new(CountingEvents::default());
    let mut config = HostConfig {
        port,
        ..Default::default()
    };
    config_tweak(&mut config);
    let hub = Hub::new(config, events.clone()).unwrap();
    hub.start().unwrap();
    (hub, events, SocketAddr::from(([127, 0, 0, 1], port)))
}

/// Minimal protocol client for tests.
struct TestClient {
    stream: TcpStream,
    tx: Option<DirectionCipher>,
    rx: Option<DirectionCipher>,
}

impl TestClient {
    fn connect(addr: SocketAddr) -> Self {
        let mut stream = retry_connect(addr);
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();

        let (mut handshake, opening) = ClientHandshake::start(ClientHandshakeConfig {
            supports_encryption: true,
            password: None,
            identity: None,
            expect_server_identity: None,
        });
        write_plain(&mut stream, opening.0, &opening.1);

        while handshake.phase() != HandshakePhase::Ready {
            let (header, payload) = read_raw(&mut stream).expect("handshake packet");
            let replies = handshake
                .handle_packet(header.packet_type, &payload)
                .expect("handshake step");
            for (packet_type, reply) in replies {
                write_plain(&mut stream, packet_type, &reply);
            }
        }
        let keys = handshake.take_keys();
        Self {
            stream,
            tx: keys.tx,
            rx: keys.rx,
        }
    }

    fn send(&mut self, packet_type: PacketType, payload: &[u8]) {
        let body = match (&mut self.tx, packet_type.is_handshake()) {
            (Some(cipher), false) => cipher.seal(payload).unwrap(),
            _ => Bytes::copy_from_slice(payload),
        };
        let packet = wire::encode_packet(packet_type, 0, &body);
        use std::io::Write;
        self.stream.write_all(&packet).unwrap();
    }

    /// Receives and decrypts the next packet. The hub's final bad-data
    /// `REMOTE_LOG`/`ERROR` packets are plaintext even on an encrypted
    /// session; fall back accordingly.
    fn recv(&mut self, deadline: Duration) -> Option<(PacketType, Bytes)> {
        let (header, payload) = read_raw_deadline(&mut self.stream, deadline)?;
        if header.packet_type.is_handshake() {
            return Some((header.packet_type, payload));
        }
        match &mut self.rx {
            Some(cipher) => match cipher.open(&payload) {
                Ok(plaintext) => Some((header.packet_type, plaintext)),
                Err(_)
                    if matches!(
                        header.packet_type,
                        PacketType::RemoteLog | PacketType::Error
                    ) =>
                {
                    Some((header.packet_type, payload))
                }
                Err(e) => panic!("cannot decrypt {:?}: {e}", header.packet_type),
            },
            None => Some((header.packet_type, payload)),
        }
    }

    /// Receives until a packet of `wanted` arrives; panics on deadline.
    fn recv_until(&mut self, wanted: PacketType, deadline: Duration) -> Bytes {
        let started = Instant::now();
        while started.elapsed() < deadline {
            if let Some((packet_type, payload)) = self.recv(Duration::from_millis(200)) {
                if packet_type == wanted {
                    return payload;
                }
            }
        }
        panic!("no {wanted:?} within {deadline:?}");
    }

    fn join(&mut self, name: &str, caps: u32) {
        let join = ClientJoin {
            caps,
            display_name: name.to_string(),
        };
        self.send(PacketType::ClientJoin, &join.encode());
    }

    fn capabilities(&mut self, width: u16, height: u16, fps: u8) {
        let caps = ClientCapabilities {
            width,
            height,
            color_level: ColorLevel::TrueColor,
            render_mode: RenderMode::HalfBlock,
            palette: 0,
            desired_fps: fps,
            flags: 0,
            custom_palette: String::new(),
        };
        self.send(PacketType::ClientCapabilities, &caps.encode());
    }
}

fn retry_connect(addr: SocketAddr) -> TcpStream {
    let started = Instant::now();
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) if started.elapsed() < Duration::from_secs(2) => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("cannot connect to {addr}: {e}"),
        }
    }
}

fn write_plain(stream: &mut TcpStream, packet_type: PacketType, payload: &[u8]) {
    use std::io::Write;
    stream
        .write_all(&wire::encode_packet(packet_type, 0, payload))
        .unwrap();
}

fn read_raw(stream: &mut TcpStream) -> Option<(wire::WireHeader, Bytes)> {
    read_raw_deadline(stream, Duration::from_secs(5))
}

fn read_raw_deadline(
    stream: &mut TcpStream,
    deadline: Duration,
) -> Option<(wire::WireHeader, Bytes)> {
    match read_framed(stream, deadline, MAX_PAYLOAD, &|| false) {
        Ok(Ok(ReadOutcome::Packet(header, payload))) => Some((header, payload.freeze())),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => panic!("wire error from server: {e}"),
        Err(_) => None,
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, condition: F) {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if condition() {
            return;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("timed out waiting for {what}");
}

fn solid_rgb(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; (width * height * 3) as usize]
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn single_client_join_no_streams() {
    let (hub, events, addr) = fixed_port_hub(|_| {});

    let mut client = TestClient::connect(addr);
    client.join("A", 0);
    client.capabilities(80, 24, 60);

    wait_for("join callback", Duration::from_secs(2), || {
        events.joins.load(Ordering::SeqCst) == 1
    });
    assert_eq!(hub.client_count(), 1);

    let id = hub.client_ids()[0];
    wait_for("capabilities applied", Duration::from_secs(2), || {
        let info = hub.find_client(id).unwrap();
        info.terminal_width == 80 && info.terminal_height == 24
    });
    let info = hub.find_client(id).unwrap();
    assert_eq!(info.display_name, "A");
    assert!(!info.is_sending_video);

    hub.stop();
}

#[test]
fn ping_is_answered_directly() {
    let (hub, _events, addr) = fixed_port_hub(|_| {});

    let mut client = TestClient::connect(addr);
    client.join("pinger", 0);
    client.send(PacketType::Ping, &control::encode_ping(424242));
    let pong = client.recv_until(PacketType::Pong, Duration::from_secs(2));
    assert_eq!(control::decode_ping(&pong).unwrap(), 424242);

    hub.stop();
}

#[test]
fn two_client_video_exchange_with_barrier() {
    let (hub, _events, addr) = fixed_port_hub(|_| {});

    let mut viewer = TestClient::connect(addr);
    viewer.join("viewer", 0);
    viewer.capabilities(80, 24, 30);

    let mut sender = TestClient::connect(addr);
    sender.join("sender", control::CAP_SEND_VIDEO);
    sender.send(
        PacketType::StreamStart,
        &control::StreamKinds(control::STREAM_VIDEO).encode(),
    );
    let white = solid_rgb(64, 48, 0xFF);
    for _ in 0..3 {
        sender.send(
            PacketType::ImageFrame,
            &ImageFrame::encode_legacy(64, 48, &white),
        );
        std::thread::sleep(Duration::from_millis(30));
    }

    // The grid-change barrier precedes the first affected frame; once the
    // white frame lands in the sender's ingress, every later composite
    // carries it (latest-only buffers never go backwards).
    let started = Instant::now();
    let mut saw_clear = false;
    let mut first_frame_seen = false;
    let mut saw_white = false;
    while started.elapsed() < Duration::from_secs(5) && !saw_white {
        match viewer.recv(Duration::from_millis(200)) {
            Some((PacketType::ClearConsole, _)) => saw_clear = true,
            Some((PacketType::AsciiFrame, payload)) => {
                if !first_frame_seen {
                    assert!(saw_clear, "ASCII_FRAME arrived before CLEAR_CONSOLE");
                    first_frame_seen = true;
                }
                let text = std::str::from_utf8(&payload).unwrap();
                assert!(!text.trim().is_empty());
                // White pixels in half-block truecolor mode paint 255,255,255.
                saw_white = text.contains("255;255;255");
            }
            _ => {}
        }
    }
    assert!(saw_white, "no white composite within deadline");

    // The sender streams but receives no composite of itself: the only
    // video source is the sender, so its own view has zero peers.
    assert!(
        sender.recv(Duration::from_millis(300)).map(|(t, _)| t) != Some(PacketType::AsciiFrame),
        "sender must not receive frames derived from itself"
    );

    hub.stop();
}

#[test]
fn audio_mix_excludes_self() {
    let (hub, _events, addr) = fixed_port_hub(|_| {});

    let mut listener = TestClient::connect(addr);
    listener.join("listener", control::CAP_SEND_AUDIO);

    let mut talker = TestClient::connect(addr);
    talker.join("talker", control::CAP_SEND_AUDIO);

    // Listener announces itself with a silent PCM batch (keeps the talker's
    // mixer running), talker sends a 1kHz tone as an Opus batch.
    let silence = AudioBatch {
        batch_count: 1,
        sample_rate: 48_000,
        channels: 1,
        samples: vec![0.0; 4800],
    };
    listener.send(PacketType::AudioBatch, &silence.encode());

    let tone: Vec<f32> = (0..960 * 5)
        .map(|n| (n as f32 * 1000.0 * std::f32::consts::TAU / 48_000.0).sin() * 0.5)
        .collect();
    let mut opus_encoder = opus::Encoder::new(48_000, opus::Channels::Mono, opus::Application::Voip).unwrap();
    let mut frames = Vec::new();
    for chunk in tone.chunks_exact(960) {
        let mut buf = [0u8; 1024];
        let len = opus_encoder.encode_float(chunk, &mut buf).unwrap();
        frames.push(Bytes::copy_from_slice(&buf[..len]));
    }
    let batch = OpusBatch {
        sample_rate: 48_000,
        frame_duration_ms: 20,
        frames,
    };
    talker.send(PacketType::AudioOpusBatch, &batch.encode());

    // The listener hears the tone.
    let mut decoder = opus::Decoder::new(48_000, opus::Channels::Mono).unwrap();
    let payload = listener.recv_until(PacketType::AudioOpus, Duration::from_secs(5));
    let single = OpusSingle::decode(payload).unwrap();
    let mut pcm = [0f32; 960];
    let samples = decoder.decode_float(&single.frame, &mut pcm, false).unwrap();
    assert_eq!(samples, 960);
    let rms = (pcm.iter().map(|s| (*s as f64).powi(2)).sum::<f64>() / 960.0).sqrt();
    assert!(rms > 0.05, "listener should hear the tone, RMS {rms}");

    // The talker hears near-silence (its own tone is excluded; the only
    // other source sent zeros).
    let payload = talker.recv_until(PacketType::AudioOpus, Duration::from_secs(5));
    let single = OpusSingle::decode(payload).unwrap();
    let mut decoder = opus::Decoder::new(48_000, opus::Channels::Mono).unwrap();
    let samples = decoder.decode_float(&single.frame, &mut pcm, false).unwrap();
    let rms = (pcm[..samples].iter().map(|s| (*s as f64).powi(2)).sum::<f64>()
        / samples as f64)
        .sqrt();
    assert!(rms < 1e-3, "talker must not hear itself, RMS {rms}");

    hub.stop();
}

#[test]
fn bad_crc_disconnects_with_final_packets() {
    let (hub, events, addr) = fixed_port_hub(|_| {});

    let mut client = TestClient::connect(addr);
    client.join("corrupt", 0);
    wait_for("client registered", Duration::from_secs(2), || {
        hub.client_count() == 1
    });

    // A frame packet with a corrupted payload byte (CRC now mismatches).
    let body = ImageFrame::encode_legacy(4, 4, &solid_rgb(4, 4, 1));
    client.send_corrupted(PacketType::ImageFrame, &body);

    let log_payload = client.recv_until(PacketType::RemoteLog, Duration::from_secs(3));
    let log = RemoteLog::decode(&log_payload).unwrap();
    assert!(
        log.message.starts_with("Protocol violation:"),
        "unexpected reason: {}",
        log.message
    );

    let error_payload = client.recv_until(PacketType::Error, Duration::from_secs(3));
    let error = ErrorPacket::decode(&error_payload).unwrap();
    assert_eq!(error.code, 1);

    wait_for("client removed", Duration::from_secs(3), || {
        hub.client_count() == 0
    });
    wait_for("leave callback", Duration::from_secs(3), || {
        events.leaves.load(Ordering::SeqCst) == 1
    });

    hub.stop();
}

#[test]
fn shutdown_joins_everything() {
    let (hub, events, addr) = fixed_port_hub(|_| {});

    let mut clients: Vec<TestClient> = (0..3)
        .map(|n| {
            let mut client = TestClient::connect(addr);
            client.join(&format!("c{n}"), 0);
            client
        })
        .collect();
    wait_for("all joined", Duration::from_secs(3), || {
        events.joins.load(Ordering::SeqCst) == 3
    });
    assert_eq!(hub.client_count(), 3);

    let stop_started = Instant::now();
    hub.stop();
    // Joins are bounded by the workers' bounded waits.
    assert!(stop_started.elapsed() < Duration::from_secs(15));
    assert_eq!(hub.client_count(), 0);
    assert_eq!(events.leaves.load(Ordering::SeqCst), 3);

    // Each client observes the goodbye or the close.
    for client in clients.iter_mut() {
        let mut saw_goodbye_or_eof = false;
        for _ in 0..50 {
            match client.recv(Duration::from_millis(100)) {
                Some((PacketType::ClientLeave, _)) => {
                    saw_goodbye_or_eof = true;
                    break;
                }
                Some(_) => {}
                None => {
                    saw_goodbye_or_eof = true;
                    break;
                }
            }
        }
        assert!(saw_goodbye_or_eof);
    }
}

#[test]
fn server_full_is_rejected_with_error_packet() {
    let (hub, _events, addr) = fixed_port_hub(|config| {
        config.limits.max_clients = 1;
    });

    let _first = TestClient::connect(addr);
    wait_for("first admitted", Duration::from_secs(2), || {
        hub.client_count() == 1
    });

    // The second connection is refused before any handshake: the server
    // sends a plaintext ERROR and closes.
    let mut stream = retry_connect(addr);
    stream
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();
    let (header, payload) = read_raw(&mut stream).expect("rejection packet");
    assert_eq!(header.packet_type, PacketType::Error);
    let error = ErrorPacket::decode(&payload).unwrap();
    assert_eq!(error.code, 3);

    hub.stop();
}

impl TestClient {
    /// Sends a packet whose payload CRC is deliberately wrong.
    fn send_corrupted(&mut self, packet_type: PacketType, payload: &[u8]) {
        let body = match &mut self.tx {
            Some(cipher) => cipher.seal(payload).unwrap(),
            None => Bytes::copy_from_slice(payload),
        };
        let mut packet = wire::encode_packet(packet_type, 0, &body).to_vec();
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        use std::io::Write;
        self.stream.write_all(&packet).unwrap();
    }
}

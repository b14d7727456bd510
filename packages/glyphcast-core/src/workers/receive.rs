//! Per-client receive worker: handshake, framed reads, packet dispatch, and
//! the idempotent bad-data disconnect.
//!
//! One worker per socket client. It performs the server-side handshake,
//! spawns the client's render and send workers, then reads framed packets
//! until shutdown or disconnect. On exit it joins the sibling workers,
//! removes the record from the registry, and fires `on_client_leave`.

use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::client::ClientRecord;
use crate::codec::{self, AudioDecoder, MAX_DECODE_SAMPLES};
use crate::crypto::{HandshakePhase, ServerHandshake, ServerHandshakeConfig};
use crate::error::{ErrorCode, HubError};
use crate::hub::{self, HubShared};
use crate::protocol::control::{
    self, ClientCapabilities, ClientJoin, RemoteLog, SizeUpdate, StreamKinds,
};
use crate::protocol::media::{AudioBatch, ImageFrame, OpusBatch, OpusSingle};
use crate::protocol::wire::{read_framed, ReadOutcome};
use crate::protocol::PacketType;

use super::audio::run_audio_render_worker;
use super::send::{run_send_worker, send_to_client};
use super::video::run_video_render_worker;

/// Whole-packet read deadline in the main loop. Idle timeouts inside this
/// window just re-check the shutdown flags; a peer stalling mid-frame longer
/// than this is gone.
const READ_DEADLINE: Duration = Duration::from_secs(10);

/// Socket-level read timeout; bounds every blocking wait so shutdown is
/// observed within ~100ms.
const SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

/// What the dispatcher wants the read loop to do next.
enum Flow {
    Continue,
    /// Orderly departure (`CLIENT_LEAVE`).
    Leave,
    /// Protocol violation; tear the client down with the given reason.
    Disconnect(ErrorCode, String),
}

/// The standardized, idempotent bad-data disconnect.
///
/// First caller wins the CAS and performs the teardown: a final plaintext
/// `REMOTE_LOG` and `ERROR` (best effort, serialized by the send mutex),
/// lifecycle flags, queue shutdown, transport half-close.
pub fn disconnect_for_bad_data(
    shared: &HubShared,
    record: &ClientRecord,
    code: ErrorCode,
    reason: &str,
) {
    if record
        .protocol_disconnect_requested
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }
    log::warn!("[Client {}] disconnecting for bad data: {reason}", record.id);

    let log_line = RemoteLog::new(remote_log_level::ERROR, reason);
    let _ = send_to_client(record, PacketType::RemoteLog, &log_line.encode(), true);
    let error = control::ErrorPacket {
        code: code as u32,
        reason: reason.to_string(),
    };
    let _ = send_to_client(record, PacketType::Error, &error.encode(), true);

    shared
        .events
        .on_error(Some(record.id), &HubError::Protocol(reason.to_string()));
    record.begin_shutdown();
    record.transport.half_close();
}

/// Remote log severity values shared with clients.
pub mod remote_log_level {
    pub const ERROR: u8 = 1;
    pub const WARN: u8 = 2;
    pub const INFO: u8 = 3;
    pub const DEBUG: u8 = 4;
}

/// Entry point of the receive worker thread.
pub fn run_receive_worker(shared: Arc<HubShared>, record: Arc<ClientRecord>, mut stream: TcpStream) {
    // Some platforms hand accepted sockets over with the listener's
    // non-blocking flag still set; this worker relies on bounded blocking
    // reads instead.
    if stream.set_nonblocking(false).is_err()
        || stream.set_read_timeout(Some(SOCKET_TIMEOUT)).is_err()
    {
        record.begin_shutdown();
        finish_client(&shared, &record, Vec::new());
        return;
    }

    if !perform_handshake(&shared, &record, &mut stream) {
        finish_client(&shared, &record, Vec::new());
        return;
    }
    log::info!(
        "[Client {}] session established ({})",
        record.id,
        record
            .remote_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".into())
    );

    // Sibling workers start only after the session is READY; they are joined
    // before this record leaves the registry.
    let workers = match spawn_siblings(&shared, &record) {
        Ok(workers) => workers,
        Err((workers, e)) => {
            shared.events.on_error(
                Some(record.id),
                &HubError::Resource(format!("cannot spawn client workers: {e}")),
            );
            record.begin_shutdown();
            finish_client(&shared, &record, workers);
            return;
        }
    };

    read_loop(&shared, &record, &mut stream);
    finish_client(&shared, &record, workers);
}

type SpawnError = (Vec<JoinHandle<()>>, std::io::Error);

fn spawn_siblings(
    shared: &Arc<HubShared>,
    record: &Arc<ClientRecord>,
) -> Result<Vec<JoinHandle<()>>, SpawnError> {
    let mut workers = Vec::with_capacity(3);
    let entries: [(&str, fn(Arc<HubShared>, Arc<ClientRecord>)); 3] = [
        ("video-render", run_video_render_worker),
        ("audio-render", run_audio_render_worker),
        ("send", run_send_worker),
    ];
    for (name, entry) in entries {
        let shared = shared.clone();
        let record = record.clone();
        let client_id = record.id.0;
        match std::thread::Builder::new()
            .name(format!("{name}-{client_id}"))
            .spawn(move || entry(shared, record))
        {
            Ok(handle) => workers.push(handle),
            Err(e) => return Err((workers, e)),
        }
    }
    Ok(workers)
}

/// Drives the server-side handshake to READY. Returns false on any failure;
/// the failure path has already torn the client down.
fn perform_handshake(shared: &HubShared, record: &ClientRecord, stream: &mut TcpStream) -> bool {
    let mut handshake = ServerHandshake::new(ServerHandshakeConfig {
        encryption_enabled: shared.config.encryption_enabled,
        password: shared.config.password.clone(),
        identity: shared.identity.clone(),
        allowlist: shared.allowlist.clone(),
    });
    let step_deadline = Duration::from_secs(shared.config.timing.handshake_step_secs);
    let max_payload = shared.config.limits.max_payload_bytes;
    let should_stop = || shared.should_exit.load(Ordering::Acquire) || !record.is_active();

    while handshake.phase() != HandshakePhase::Ready {
        match read_framed(stream, step_deadline, max_payload, &should_stop) {
            Ok(Ok(ReadOutcome::Packet(header, payload))) => {
                match handshake.handle_packet(header.packet_type, &payload) {
                    Ok(replies) => {
                        for (packet_type, reply) in replies {
                            if send_to_client(record, packet_type, &reply, true).is_err() {
                                record.begin_shutdown();
                                return false;
                            }
                        }
                    }
                    Err(e) => {
                        disconnect_for_bad_data(
                            shared,
                            record,
                            ErrorCode::CryptoFailure,
                            &format!("Handshake failed: {e}"),
                        );
                        return false;
                    }
                }
            }
            Ok(Ok(ReadOutcome::TimedOut)) => {
                log::info!("[Client {}] handshake step timed out", record.id);
                record.begin_shutdown();
                record.transport.half_close();
                return false;
            }
            Ok(Ok(ReadOutcome::ShutDown)) => {
                record.begin_shutdown();
                return false;
            }
            Ok(Err(wire_error)) => {
                disconnect_for_bad_data(
                    shared,
                    record,
                    ErrorCode::ProtocolViolation,
                    &format!("Protocol violation: {wire_error}"),
                );
                return false;
            }
            Err(e) => {
                log::info!("[Client {}] transport error in handshake: {e}", record.id);
                record.begin_shutdown();
                return false;
            }
        }
    }

    let keys = handshake.take_keys();
    *record.tx_cipher.lock() = keys.tx;
    *record.rx_cipher.lock() = keys.rx;
    record.session_ready.store(true, Ordering::Release);
    true
}

fn read_loop(shared: &Arc<HubShared>, record: &Arc<ClientRecord>, stream: &mut TcpStream) {
    let mut decode_scratch = vec![0f32; MAX_DECODE_SAMPLES];
    let max_payload = shared.config.limits.max_payload_bytes;
    let should_stop = || shared.should_exit.load(Ordering::Acquire) || !record.is_active();

    while !should_stop() {
        match read_framed(stream, READ_DEADLINE, max_payload, &should_stop) {
            Ok(Ok(ReadOutcome::Packet(header, payload))) => {
                let body = match unwrap_payload(shared, record, header.packet_type, payload.freeze())
                {
                    Some(body) => body,
                    None => break,
                };
                match dispatch(shared, record, header.packet_type, body, &mut decode_scratch) {
                    Flow::Continue => {}
                    Flow::Leave => {
                        log::info!("[Client {}] left", record.id);
                        record.begin_shutdown();
                        break;
                    }
                    Flow::Disconnect(code, reason) => {
                        disconnect_for_bad_data(shared, record, code, &reason);
                        break;
                    }
                }
            }
            Ok(Ok(ReadOutcome::TimedOut)) => {}
            Ok(Ok(ReadOutcome::ShutDown)) => break,
            Ok(Err(wire_error)) => {
                disconnect_for_bad_data(
                    shared,
                    record,
                    ErrorCode::ProtocolViolation,
                    &format!("Protocol violation: {wire_error}"),
                );
                break;
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    shared
                        .events
                        .on_error(Some(record.id), &HubError::Transport(e));
                }
                record.begin_shutdown();
                break;
            }
        }
    }
}

/// Removes the AEAD envelope from post-handshake packets. Returns `None`
/// after initiating a disconnect.
fn unwrap_payload(
    shared: &HubShared,
    record: &ClientRecord,
    packet_type: PacketType,
    payload: Bytes,
) -> Option<Bytes> {
    if packet_type.is_handshake() {
        // The handshake is over; a replayed handshake packet is a violation.
        disconnect_for_bad_data(
            shared,
            record,
            ErrorCode::ProtocolViolation,
            &format!("Protocol violation: handshake packet {packet_type:?} after READY"),
        );
        return None;
    }
    let opened = {
        let mut cipher = record.rx_cipher.lock();
        match cipher.as_mut() {
            Some(cipher) => Some(cipher.open(&payload)),
            // Explicit no-encrypt mode.
            None => None,
        }
    };
    match opened {
        None => Some(payload),
        Some(Ok(plaintext)) => Some(plaintext),
        Some(Err(e)) => {
            disconnect_for_bad_data(
                shared,
                record,
                ErrorCode::CryptoFailure,
                &format!("Decryption failed: {e}"),
            );
            None
        }
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

fn dispatch(
    shared: &Arc<HubShared>,
    record: &Arc<ClientRecord>,
    packet_type: PacketType,
    body: Bytes,
    decode_scratch: &mut [f32],
) -> Flow {
    match packet_type {
        PacketType::ClientJoin => match ClientJoin::decode(&body) {
            Ok(join) => {
                {
                    let mut profile = record.profile.lock();
                    profile.display_name = join.display_name;
                    profile.can_send_video = join.caps & control::CAP_SEND_VIDEO != 0;
                    profile.can_send_audio = join.caps & control::CAP_SEND_AUDIO != 0;
                    profile.wants_stretch = join.caps & control::CAP_WANTS_STRETCH != 0;
                }
                shared.events.on_client_join(&record.info());
                hub::broadcast_server_state(shared);
                Flow::Continue
            }
            Err(e) => protocol_violation(e),
        },

        PacketType::ClientCapabilities => match ClientCapabilities::decode(&body) {
            Ok(caps) => {
                record.profile.lock().apply_capabilities(&caps);
                Flow::Continue
            }
            Err(e) => protocol_violation(e),
        },

        PacketType::Size => match SizeUpdate::decode(&body) {
            Ok(size) => {
                let mut profile = record.profile.lock();
                profile.terminal_width = size.width;
                profile.terminal_height = size.height;
                Flow::Continue
            }
            Err(e) => protocol_violation(e),
        },

        PacketType::StreamStart | PacketType::StreamStop => {
            let starting = packet_type == PacketType::StreamStart;
            match StreamKinds::decode(&body) {
                Ok(kinds) => {
                    if kinds.video() {
                        record.is_sending_video.store(starting, Ordering::Release);
                    }
                    if kinds.audio() {
                        record.is_sending_audio.store(starting, Ordering::Release);
                        let mut decoder = record.opus_decoder.lock();
                        if starting && decoder.is_none() {
                            match AudioDecoder::new() {
                                Ok(new_decoder) => *decoder = Some(new_decoder),
                                Err(e) => {
                                    return Flow::Disconnect(
                                        ErrorCode::Internal,
                                        format!("Cannot create audio decoder: {e}"),
                                    )
                                }
                            }
                        } else if !starting {
                            *decoder = None;
                        }
                    }
                    Flow::Continue
                }
                Err(e) => protocol_violation(e),
            }
        }

        PacketType::ImageFrame => handle_image_frame(shared, record, body),

        PacketType::AudioBatch => match AudioBatch::decode(&body) {
            Ok(batch) => {
                ingest_pcm(shared, record, &batch.samples);
                Flow::Continue
            }
            Err(e) => protocol_violation(e),
        },

        PacketType::AudioOpus => match OpusSingle::decode(body) {
            Ok(single) => decode_opus_frames(shared, record, &[single.frame], decode_scratch),
            Err(e) => protocol_violation(e),
        },

        PacketType::AudioOpusBatch => match OpusBatch::decode(body) {
            Ok(batch) => decode_opus_frames(shared, record, &batch.frames, decode_scratch),
            Err(e) => protocol_violation(e),
        },

        // Legacy raw-PCM packets are tolerated but no longer ingested.
        PacketType::Audio => {
            log::debug!("[Client {}] ignoring deprecated AUDIO packet", record.id);
            Flow::Continue
        }

        PacketType::Ping => match control::decode_ping(&body) {
            Ok(echo) => {
                record.last_ping_us.store(now_micros(), Ordering::Relaxed);
                // Direct send under the send mutex, not enqueued.
                let _ = send_to_client(
                    record,
                    PacketType::Pong,
                    &control::encode_ping(echo),
                    false,
                );
                Flow::Continue
            }
            Err(e) => protocol_violation(e),
        },

        PacketType::ClientLeave => Flow::Leave,

        PacketType::RemoteLog => match RemoteLog::decode(&body) {
            Ok(remote) => {
                let name = record.display_name();
                let level = match remote.level {
                    remote_log_level::ERROR => log::Level::Error,
                    remote_log_level::WARN => log::Level::Warn,
                    remote_log_level::DEBUG => log::Level::Debug,
                    _ => log::Level::Info,
                };
                log::log!(
                    level,
                    "[Remote {} \"{}\"]{} {}",
                    record.id,
                    name,
                    if remote.truncated { " (truncated)" } else { "" },
                    remote.message
                );
                Flow::Continue
            }
            Err(e) => protocol_violation(e),
        },

        other => Flow::Disconnect(
            ErrorCode::ProtocolViolation,
            format!("Protocol violation: unexpected packet type {other:?} from client"),
        ),
    }
}

fn protocol_violation(error: impl std::fmt::Display) -> Flow {
    Flow::Disconnect(
        ErrorCode::ProtocolViolation,
        format!("Protocol violation: {error}"),
    )
}

fn handle_image_frame(shared: &HubShared, record: &ClientRecord, body: Bytes) -> Flow {
    let max_dimension = shared.config.limits.max_frame_dimension;
    let frame = match ImageFrame::decode(body, max_dimension) {
        Ok(frame) => frame,
        Err(e) => return protocol_violation(e),
    };
    let width = frame.width();
    let height = frame.height();
    let expected = match frame.rgb_len() {
        Ok(expected) => expected,
        Err(e) => return protocol_violation(e),
    };

    let rgb: Bytes = match frame {
        ImageFrame::Raw { data, .. } => data,
        ImageFrame::Compressed { data, .. } => match codec::inflate_frame(&data, expected) {
            Ok(inflated) => Bytes::from(inflated),
            Err(e) => return protocol_violation(e),
        },
    };

    {
        let mut write = record.ingress_video.begin_write();
        let slot = write.slot();
        slot.data.clear();
        slot.data.extend_from_slice(&rgb);
        slot.width = width;
        slot.height = height;
        slot.capture_timestamp_us = now_micros();
        if let Err(e) = write.commit() {
            return protocol_violation(e);
        }
    }

    // Implicit stream start on the first valid frame; cleared only by
    // STREAM_STOP or removal.
    let _ = record.is_sending_video.compare_exchange(
        false,
        true,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    record.frames_received.fetch_add(1, Ordering::Relaxed);
    record
        .stats
        .frames_received
        .fetch_add(1, Ordering::Relaxed);
    shared.events.on_frame_received(record.id, width, height);
    Flow::Continue
}

/// Deposits raw PCM into the client's ingress ring.
fn ingest_pcm(shared: &HubShared, record: &ClientRecord, samples: &[f32]) {
    let _ = record.is_sending_audio.compare_exchange(
        false,
        true,
        Ordering::AcqRel,
        Ordering::Acquire,
    );
    record.ingress_audio.write(samples);
    record
        .stats
        .audio_samples_received
        .fetch_add(samples.len() as u64, Ordering::Relaxed);
    shared.events.on_audio_received(record.id, samples.len());
}

/// Decodes a run of Opus frames into the ingress ring. A frame that fails to
/// decode is skipped; the rest of the batch still lands.
fn decode_opus_frames(
    shared: &HubShared,
    record: &ClientRecord,
    frames: &[Bytes],
    scratch: &mut [f32],
) -> Flow {
    let mut decoder_slot = record.opus_decoder.lock();
    if decoder_slot.is_none() {
        match AudioDecoder::new() {
            Ok(new_decoder) => *decoder_slot = Some(new_decoder),
            Err(e) => {
                return Flow::Disconnect(
                    ErrorCode::Internal,
                    format!("Cannot create audio decoder: {e}"),
                )
            }
        }
    }
    let decoder = decoder_slot.as_mut().expect("decoder just ensured");

    let mut total = 0usize;
    for frame in frames {
        match decoder.decode(frame, scratch) {
            Ok(samples) => {
                record.ingress_audio.write(&scratch[..samples]);
                total += samples;
            }
            Err(e) => {
                log::warn!("[Client {}] dropping undecodable opus frame: {e}", record.id);
            }
        }
    }
    drop(decoder_slot);

    if total > 0 {
        let _ = record.is_sending_audio.compare_exchange(
            false,
            true,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        record
            .stats
            .audio_samples_received
            .fetch_add(total as u64, Ordering::Relaxed);
        shared.events.on_audio_received(record.id, total);
    }
    Flow::Continue
}

/// Joins the sibling workers, removes the record from the registry, and
/// fires the leave callback. The record's destructor runs only after every
/// worker referencing it has been joined.
fn finish_client(shared: &HubShared, record: &ClientRecord, workers: Vec<JoinHandle<()>>) {
    record.begin_shutdown();
    for worker in workers {
        let _ = worker.join();
    }
    if shared.registry.remove(record.id).is_some() {
        shared.events.on_client_leave(record.id);
        hub::broadcast_server_state(shared);
    }
    record.stats.log_summary(record.id);
    record.transport.half_close();
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;
    use std::net::TcpListener;

    use crate::client::{Attachment, ClientId};
    use crate::config::HostConfig;
    use crate::events::NoopHubEvents;
    use crate::hub::Hub;
    use crate::protocol::wire;
    use crate::transport::TransportSlot;

    #[test]
    fn bad_data_disconnect_is_idempotent() {
        let hub = Hub::new(
            HostConfig {
                port: 0,
                ..Default::default()
            },
            Arc::new(NoopHubEvents),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_side = std::net::TcpStream::connect(addr).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let record = ClientRecord::new(
            ClientId(9),
            Some(addr),
            Attachment::Network,
            TransportSlot::from_socket(peer),
            &HostConfig::default(),
        );

        disconnect_for_bad_data(
            hub.shared(),
            &record,
            ErrorCode::ProtocolViolation,
            "Protocol violation: test",
        );
        // Second invocation must be a no-op: no further packets, no panic.
        disconnect_for_bad_data(
            hub.shared(),
            &record,
            ErrorCode::ProtocolViolation,
            "Protocol violation: again",
        );
        assert!(!record.is_active());
        assert!(record.shutting_down.load(Ordering::Acquire));

        // Exactly one REMOTE_LOG and one ERROR landed on the wire.
        let mut on_the_wire = Vec::new();
        let mut stream = client_side;
        stream.read_to_end(&mut on_the_wire).unwrap();
        let (first, rest) = {
            let (header, payload) =
                wire::parse_packet_prefix(&on_the_wire).expect("first packet");
            (header, &on_the_wire[wire::HEADER_LEN + payload.len()..])
        };
        assert_eq!(first.packet_type, PacketType::RemoteLog);
        let (second_header, second_payload) =
            wire::parse_packet_prefix(rest).expect("second packet");
        assert_eq!(second_header.packet_type, PacketType::Error);
        assert_eq!(
            wire::HEADER_LEN + second_payload.len(),
            rest.len(),
            "no third packet after the idempotent teardown"
        );
    }
}

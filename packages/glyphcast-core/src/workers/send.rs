//! Per-client send worker: drains the prioritized egress queue and the
//! egress video buffer onto the client transport.
//!
//! Priority: queue entries (errors and audio, high band first) before video;
//! a `CLEAR_CONSOLE` barrier precedes the first video frame whose grid
//! source count differs from the previously sent one.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::buffers::FrameSlot;
use crate::client::ClientRecord;
use crate::error::HubError;
use crate::hub::HubShared;
use crate::protocol::{wire, PacketType};

/// How long one drain cycle blocks on the egress queue before checking the
/// video buffer and the shutdown flags.
const DEQUEUE_SLICE: Duration = Duration::from_millis(10);

/// Encrypts (when the session is ready) and writes one packet to the client.
///
/// Handshake packets and the bad-data path's final writes stay plaintext;
/// everything else is sealed with the client's tx cipher.
pub fn send_to_client(
    record: &ClientRecord,
    packet_type: PacketType,
    payload: &[u8],
    force_plaintext: bool,
) -> Result<(), HubError> {
    let encrypt = !force_plaintext
        && !packet_type.is_handshake()
        && record.session_ready.load(Ordering::Acquire);

    if encrypt {
        // Seal order must equal write order or the peer's nonce counter
        // desyncs, so the cipher lock is held across the transport write.
        let mut cipher = record.tx_cipher.lock();
        if let Some(cipher) = cipher.as_mut() {
            let envelope = cipher
                .seal(payload)
                .map_err(|e| HubError::Crypto(e.to_string()))?;
            let wire_packet = wire::encode_packet(packet_type, 0, &envelope);
            record.transport.send_packet(&wire_packet)?;
            record.stats.record_send(
                wire_packet.len(),
                matches!(packet_type, PacketType::AsciiFrame),
            );
            return Ok(());
        }
        // Session ready without ciphers: explicit no-encrypt mode.
    }

    let wire_packet = wire::encode_packet(packet_type, 0, payload);
    record.transport.send_packet(&wire_packet)?;
    record.stats.record_send(
        wire_packet.len(),
        matches!(packet_type, PacketType::AsciiFrame),
    );
    Ok(())
}

/// Send worker loop. Exits when the hub stops or the client goes inactive.
pub fn run_send_worker(shared: Arc<HubShared>, record: Arc<ClientRecord>) {
    let mut video_scratch = FrameSlot::default();
    let mut last_video_seq = 0u64;
    // Grid source count of the last video frame actually sent; the barrier
    // fires on the first frame after this changes.
    let mut last_sent_grid: Option<usize> = None;

    log::debug!("[Client {}] send worker started", record.id);
    while !shared.should_exit.load(Ordering::Acquire) && record.is_active() {
        // Queue first: errors and audio outrank video.
        if let Some(packet) = record.egress_audio.dequeue_blocking(DEQUEUE_SLICE) {
            if let Err(error) =
                send_to_client(&record, packet.packet_type, &packet.payload, false)
            {
                fail_transport(&shared, &record, error);
                break;
            }
            // Keep draining audio backlog before looking at video again.
            if record.egress_audio.len() > 0 {
                continue;
            }
        }

        let seq = record.egress_video.latest_sequence();
        if seq > last_video_seq && record.egress_video.read_latest(&mut video_scratch) {
            let grid_sources = record.last_rendered_grid_sources.load(Ordering::Acquire);
            if last_sent_grid != Some(grid_sources) {
                if let Err(error) =
                    send_to_client(&record, PacketType::ClearConsole, &[], false)
                {
                    fail_transport(&shared, &record, error);
                    break;
                }
                last_sent_grid = Some(grid_sources);
            }
            let frame = Bytes::copy_from_slice(&video_scratch.data);
            if let Err(error) = send_to_client(&record, PacketType::AsciiFrame, &frame, false) {
                fail_transport(&shared, &record, error);
                break;
            }
            last_video_seq = video_scratch.sequence;
        }
    }
    log::debug!("[Client {}] send worker exiting", record.id);
}

/// Transport failure: mark the client inactive and surface the error. No
/// retries happen inside the send worker.
fn fail_transport(shared: &HubShared, record: &ClientRecord, error: HubError) {
    if record.is_active() {
        log::info!("[Client {}] transport failed: {error}", record.id);
        shared.events.on_error(Some(record.id), &error);
        record.begin_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Attachment, ClientId};
    use crate::config::HostConfig;
    use crate::transport::TransportSlot;

    #[test]
    fn detached_record_send_fails() {
        let record = ClientRecord::new(
            ClientId(1),
            None,
            Attachment::Memory,
            TransportSlot::detached(),
            &HostConfig::default(),
        );
        assert!(matches!(
            send_to_client(&record, PacketType::Ping, &[], false),
            Err(HubError::Transport(_))
        ));
    }
}

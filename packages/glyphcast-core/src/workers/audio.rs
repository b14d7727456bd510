//! Per-client audio render worker.
//!
//! Ticks at 100Hz, mixes every *other* sending peer's ingress audio
//! (excluding the client's own voice), accumulates 20ms of PCM, encodes it
//! with the client's Opus encoder, and enqueues the packet onto the client's
//! egress queue with high priority.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::client::ClientRecord;
use crate::codec::{AudioEncoder, MAX_OPUS_PACKET, OPUS_FRAME_SAMPLES, SAMPLE_RATE};
use crate::hub::HubShared;
use crate::mixer::MixSource;
use crate::protocol::media::OpusSingle;
use crate::protocol::PacketType;
use crate::stats::RateLimiter;

/// Default samples per 10ms tick at 48kHz.
const TICK_SAMPLES: usize = 480;

/// Catch-up read size when a peer's ring holds more than [`BACKLOG_SAMPLES`].
const CATCH_UP_SAMPLES: usize = 960;

/// ~40ms of buffered backlog at 48kHz triggers catch-up reads.
const BACKLOG_SAMPLES: usize = 1920;

/// Back-pressure is only probed every this many encodes.
const BACKPRESSURE_CHECK_INTERVAL: u64 = 100;

const LAG_FACTOR: f32 = 1.5;

pub fn run_audio_render_worker(shared: Arc<HubShared>, record: Arc<ClientRecord>) {
    let tick = Duration::from_millis(shared.config.timing.audio_tick_ms);
    let mut pacer = super::pacing::AdaptiveSleep::new(tick);
    let lag_warnings = RateLimiter::per_second();

    let mut mix_buf = vec![0f32; CATCH_UP_SAMPLES];
    let mut scratch = vec![0f32; CATCH_UP_SAMPLES];
    // Persistent 20ms accumulation buffer; encodes fire when it fills.
    let mut accumulator: Vec<f32> = Vec::with_capacity(OPUS_FRAME_SAMPLES);
    let mut packet_buf = [0u8; MAX_OPUS_PACKET];
    let mut encode_count: u64 = 0;

    log::debug!("[Client {}] audio render worker started", record.id);
    loop {
        let previous_tick = pacer.last_tick();
        if !pacer.tick(0, 0, &shared.should_exit) || !record.is_active() {
            break;
        }
        if !shared.render_enabled.load(Ordering::Acquire) {
            continue;
        }

        let peers: Vec<Arc<ClientRecord>> = shared
            .registry
            .snapshot()
            .into_iter()
            .filter(|peer| {
                peer.id != record.id
                    && peer.is_active()
                    && peer.is_sending_audio.load(Ordering::Acquire)
            })
            .collect();
        if peers.is_empty() {
            continue;
        }

        // Bounded backlog recovery: drain faster while any peer is behind.
        let samples_to_read = if peers
            .iter()
            .any(|peer| peer.ingress_audio.available_read() > BACKLOG_SAMPLES)
        {
            CATCH_UP_SAMPLES
        } else {
            TICK_SAMPLES
        };

        let mix_len = if shared.config.mixer_enabled {
            let sources: Vec<MixSource> = peers
                .iter()
                .map(|peer| MixSource {
                    id: peer.id,
                    ring: &peer.ingress_audio,
                })
                .collect();
            shared
                .mixer
                .mix_excluding(&sources, record.id, &mut mix_buf[..samples_to_read])
        } else {
            // Bypass: plain summation, unclamped. Downstream Opus tolerates
            // occasional excursions past [-1, 1].
            mix_buf[..samples_to_read].fill(0.0);
            let mut max_read = 0usize;
            for peer in &peers {
                let count = peer.ingress_audio.read(&mut scratch[..samples_to_read]);
                for (slot, sample) in mix_buf.iter_mut().zip(&scratch[..count]) {
                    *slot += *sample;
                }
                max_read = max_read.max(count);
            }
            max_read
        };
        if mix_len == 0 {
            continue;
        }

        accumulator.extend_from_slice(&mix_buf[..mix_len]);
        while accumulator.len() >= OPUS_FRAME_SAMPLES {
            encode_count += 1;

            // Probe back-pressure periodically; a backed-up egress queue
            // means the transport cannot keep up, so drop latency instead of
            // growing memory.
            if encode_count % BACKPRESSURE_CHECK_INTERVAL == 0
                && record.egress_audio.len() > shared.config.limits.audio_backlog_drop_threshold
            {
                log::warn!(
                    "[Client {}] audio egress backlog ({} packets), dropping frame",
                    record.id,
                    record.egress_audio.len()
                );
                accumulator.clear();
                break;
            }

            let encoded_len = {
                let mut encoder_slot = record.opus_encoder.lock();
                if encoder_slot.is_none() {
                    match AudioEncoder::new(
                        shared.config.opus_audio_profile,
                        shared.config.opus_bitrate,
                    ) {
                        Ok(encoder) => *encoder_slot = Some(encoder),
                        Err(e) => {
                            log::error!(
                                "[Client {}] cannot create opus encoder: {e}",
                                record.id
                            );
                            accumulator.clear();
                            break;
                        }
                    }
                }
                let encoder = encoder_slot.as_mut().expect("encoder just ensured");
                match encoder.encode(&accumulator[..OPUS_FRAME_SAMPLES], &mut packet_buf) {
                    Ok(len) => len,
                    Err(e) => {
                        log::warn!("[Client {}] opus encode failed: {e}", record.id);
                        accumulator.drain(..OPUS_FRAME_SAMPLES);
                        continue;
                    }
                }
            };

            let payload = OpusSingle {
                sample_rate: SAMPLE_RATE,
                frame_duration_ms: 20,
                frame: Bytes::copy_from_slice(&packet_buf[..encoded_len]),
            }
            .encode();
            // High priority: audio outranks video in the send worker.
            if record
                .egress_audio
                .enqueue(PacketType::AudioOpus, payload, true)
                .is_err()
            {
                // Queue full or shut down; drop the frame, stay live.
                accumulator.clear();
                break;
            }
            accumulator.drain(..OPUS_FRAME_SAMPLES);
        }

        if let Some(interval) = pacer.measured_interval(previous_tick) {
            if interval.as_secs_f32() > tick.as_secs_f32() * LAG_FACTOR && lag_warnings.fire() {
                log::warn!(
                    "[Client {}] audio render lagging: {:?} per tick (target {:?})",
                    record.id,
                    interval,
                    tick
                );
            }
        }
    }
    log::debug!("[Client {}] audio render worker exiting", record.id);
}

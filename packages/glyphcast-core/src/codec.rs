//! Owned media codec handles: Opus encode/decode and zlib frame inflation.
//!
//! Encoders and decoders are long-lived, one per client, created lazily when
//! a stream starts and destroyed with the client record.

use std::io::Read;

use opus::{Application, Bitrate, Channels};

/// Hub audio clock: Opus native rate.
pub const SAMPLE_RATE: u32 = 48_000;

/// Samples in one 20ms mono Opus frame at 48kHz.
pub const OPUS_FRAME_SAMPLES: usize = 960;

/// Encoded packet ceiling; generous for 20ms mono at any sane bitrate.
pub const MAX_OPUS_PACKET: usize = 1024;

/// Decode scratch ceiling: the largest batch a peer may send (32 frames).
pub const MAX_DECODE_SAMPLES: usize = 32 * OPUS_FRAME_SAMPLES;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("opus: {0}")]
    Opus(#[from] opus::Error),
    #[error("inflate: {0}")]
    Inflate(std::io::Error),
    #[error("inflated frame is {actual} bytes, expected {expected}")]
    InflatedSize { expected: usize, actual: usize },
}

/// Per-client Opus encoder (48kHz mono, CBR).
pub struct AudioEncoder {
    inner: opus::Encoder,
}

impl AudioEncoder {
    /// Creates an encoder with the configured profile and bitrate.
    pub fn new(audio_profile: bool, bitrate: i32) -> Result<Self, CodecError> {
        let application = if audio_profile {
            Application::Audio
        } else {
            Application::Voip
        };
        let mut inner = opus::Encoder::new(SAMPLE_RATE, Channels::Mono, application)?;
        inner.set_bitrate(Bitrate::Bits(bitrate))?;
        inner.set_vbr(false)?;
        Ok(Self { inner })
    }

    /// Encodes one 20ms frame. `pcm` must be exactly [`OPUS_FRAME_SAMPLES`].
    pub fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize, CodecError> {
        debug_assert_eq!(pcm.len(), OPUS_FRAME_SAMPLES);
        Ok(self.inner.encode_float(pcm, out)?)
    }
}

/// Per-client Opus decoder (48kHz mono).
pub struct AudioDecoder {
    inner: opus::Decoder,
}

impl AudioDecoder {
    pub fn new() -> Result<Self, CodecError> {
        Ok(Self {
            inner: opus::Decoder::new(SAMPLE_RATE, Channels::Mono)?,
        })
    }

    /// Decodes one packet into `out`, returning the sample count.
    pub fn decode(&mut self, packet: &[u8], out: &mut [f32]) -> Result<usize, CodecError> {
        Ok(self.inner.decode_float(packet, out, false)?)
    }
}

/// Inflates a zlib-compressed video frame, enforcing the exact expected size.
pub fn inflate_frame(compressed: &[u8], expected: usize) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(expected);
    let mut decoder = flate2::read::ZlibDecoder::new(compressed);
    // Read one byte past the expected size so an oversized stream is
    // detected instead of silently truncated.
    decoder
        .by_ref()
        .take(expected as u64 + 1)
        .read_to_end(&mut out)
        .map_err(CodecError::Inflate)?;
    if out.len() != expected {
        return Err(CodecError::InflatedSize {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn opus_round_trip_preserves_frame_length() {
        let mut encoder = AudioEncoder::new(false, 128_000).unwrap();
        let mut decoder = AudioDecoder::new().unwrap();

        // 440 Hz tone, one 20ms frame.
        let pcm: Vec<f32> = (0..OPUS_FRAME_SAMPLES)
            .map(|n| (n as f32 * 440.0 * std::f32::consts::TAU / SAMPLE_RATE as f32).sin() * 0.5)
            .collect();
        let mut packet = [0u8; MAX_OPUS_PACKET];
        let packet_len = encoder.encode(&pcm, &mut packet).unwrap();
        assert!(packet_len > 0);

        let mut decoded = [0f32; OPUS_FRAME_SAMPLES];
        let samples = decoder.decode(&packet[..packet_len], &mut decoded).unwrap();
        assert_eq!(samples, OPUS_FRAME_SAMPLES);
    }

    #[test]
    fn silence_decodes_to_near_silence() {
        let mut encoder = AudioEncoder::new(false, 128_000).unwrap();
        let mut decoder = AudioDecoder::new().unwrap();

        let pcm = [0f32; OPUS_FRAME_SAMPLES];
        let mut packet = [0u8; MAX_OPUS_PACKET];
        let packet_len = encoder.encode(&pcm, &mut packet).unwrap();

        let mut decoded = [0f32; OPUS_FRAME_SAMPLES];
        decoder.decode(&packet[..packet_len], &mut decoded).unwrap();
        let rms = (decoded.iter().map(|s| (*s as f64).powi(2)).sum::<f64>()
            / OPUS_FRAME_SAMPLES as f64)
            .sqrt();
        assert!(rms < 1e-4, "silence came back with RMS {rms}");
    }

    #[test]
    fn inflate_round_trips() {
        let original = vec![7u8; 3000];
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&original).unwrap();
        let compressed = encoder.finish().unwrap();

        let inflated = inflate_frame(&compressed, original.len()).unwrap();
        assert_eq!(inflated, original);
    }

    #[test]
    fn inflate_rejects_wrong_size() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&[1u8; 100]).unwrap();
        let compressed = encoder.finish().unwrap();

        assert!(matches!(
            inflate_frame(&compressed, 99),
            Err(CodecError::InflatedSize { .. })
        ));
        assert!(matches!(
            inflate_frame(&compressed, 101),
            Err(CodecError::InflatedSize { .. })
        ));
    }

    #[test]
    fn inflate_rejects_garbage() {
        assert!(matches!(
            inflate_frame(b"definitely not zlib", 16),
            Err(CodecError::Inflate(_))
        ));
    }
}

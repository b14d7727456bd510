//! Media payload layouts: image frames and audio batches.
//!
//! `IMAGE_FRAME` has two accepted layouts (legacy raw and extended with a
//! compression flag); both are modeled as [`ImageFrame`] variants and the
//! decoder picks the variant from the payload length and field values. Audio
//! travels either as normalized 32-bit integers (`AUDIO_BATCH`) or as Opus
//! payloads (`AUDIO_OPUS`, `AUDIO_OPUS_BATCH`).

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Scale factor between wire int32 samples and `[-1.0, 1.0]` floats.
const SAMPLE_SCALE: f64 = 2147483647.0;

/// Bound on `AUDIO_BATCH` sample counts: twice the largest batch a
/// well-behaved client produces (4096 samples ≈ 85ms at 48kHz).
pub const MAX_BATCH_SAMPLES: u32 = 2 * 4096;

/// Bound on Opus frames per batch packet.
pub const MAX_OPUS_FRAMES: u32 = 32;

/// Fixed prefix of an `AUDIO_OPUS` single-frame payload.
pub const OPUS_SINGLE_HEADER: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("payload too short: need {need} bytes, have {have}")]
    Short { need: usize, have: usize },
    #[error("frame dimensions {width}x{height} out of bounds (max {max})")]
    Dimensions { width: u32, height: u32, max: u32 },
    #[error("payload size mismatch: declared {declared}, actual {actual}")]
    SizeMismatch { declared: usize, actual: usize },
    #[error("sample count {count} exceeds limit {max}")]
    TooManySamples { count: u32, max: u32 },
    #[error("opus frame count {count} exceeds limit {max}")]
    TooManyFrames { count: u32, max: u32 },
    #[error("arithmetic overflow computing frame size")]
    Overflow,
}

fn need(payload: &[u8], bytes: usize) -> Result<(), MediaError> {
    if payload.len() < bytes {
        return Err(MediaError::Short {
            need: bytes,
            have: payload.len(),
        });
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// IMAGE_FRAME
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded `IMAGE_FRAME` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageFrame {
    /// Raw RGB8, `data.len() == width * height * 3`.
    Raw {
        width: u32,
        height: u32,
        data: Bytes,
    },
    /// Zlib-compressed RGB8; `data` inflates to `width * height * 3` bytes.
    Compressed {
        width: u32,
        height: u32,
        data: Bytes,
    },
}

impl ImageFrame {
    pub fn width(&self) -> u32 {
        match self {
            Self::Raw { width, .. } | Self::Compressed { width, .. } => *width,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Raw { height, .. } | Self::Compressed { height, .. } => *height,
        }
    }

    /// Byte length of the uncompressed RGB payload, overflow-checked.
    pub fn rgb_len(&self) -> Result<usize, MediaError> {
        rgb_len(self.width(), self.height())
    }

    /// Decodes either accepted layout.
    ///
    /// Layout selection: a payload that is exactly `8 + width*height*3` bytes
    /// is the legacy raw form; otherwise the extended form's declared
    /// `data_size` must account for the remainder exactly.
    pub fn decode(payload: Bytes, max_dimension: u32) -> Result<Self, MediaError> {
        need(&payload, 8)?;
        let mut cursor = &payload[..];
        let width = cursor.get_u32();
        let height = cursor.get_u32();
        if width == 0 || height == 0 || width > max_dimension || height > max_dimension {
            return Err(MediaError::Dimensions {
                width,
                height,
                max: max_dimension,
            });
        }
        let raw_len = rgb_len(width, height)?;

        if payload.len() == 8 + raw_len {
            return Ok(Self::Raw {
                width,
                height,
                data: payload.slice(8..),
            });
        }

        // Extended form: u32 compressed flag, u32 data_size, data.
        need(&payload, 16)?;
        let compressed = cursor.get_u32();
        let data_size = cursor.get_u32() as usize;
        if payload.len() != 16 + data_size {
            return Err(MediaError::SizeMismatch {
                declared: 16 + data_size,
                actual: payload.len(),
            });
        }
        let data = payload.slice(16..);
        if compressed == 0 {
            if data_size != raw_len {
                return Err(MediaError::SizeMismatch {
                    declared: raw_len,
                    actual: data_size,
                });
            }
            Ok(Self::Raw {
                width,
                height,
                data,
            })
        } else {
            Ok(Self::Compressed {
                width,
                height,
                data,
            })
        }
    }

    /// Encodes in the extended layout.
    pub fn encode(&self) -> Bytes {
        let (width, height, compressed, data) = match self {
            Self::Raw {
                width,
                height,
                data,
            } => (*width, *height, 0u32, data),
            Self::Compressed {
                width,
                height,
                data,
            } => (*width, *height, 1u32, data),
        };
        let mut buf = BytesMut::with_capacity(16 + data.len());
        buf.put_u32(width);
        buf.put_u32(height);
        buf.put_u32(compressed);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);
        buf.freeze()
    }

    /// Encodes in the legacy raw layout (no compression flag, implied size).
    pub fn encode_legacy(width: u32, height: u32, rgb: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + rgb.len());
        buf.put_u32(width);
        buf.put_u32(height);
        buf.put_slice(rgb);
        buf.freeze()
    }
}

/// `width * height * 3` with overflow checks at every step.
pub fn rgb_len(width: u32, height: u32) -> Result<usize, MediaError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(3))
        .ok_or(MediaError::Overflow)
}

// ─────────────────────────────────────────────────────────────────────────────
// AUDIO_BATCH
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded `AUDIO_BATCH` header + samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBatch {
    pub batch_count: u32,
    pub sample_rate: u32,
    pub channels: u32,
    pub samples: Vec<f32>,
}

impl AudioBatch {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.samples.len() * 4);
        buf.put_u32(self.batch_count);
        buf.put_u32(self.samples.len() as u32);
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.channels);
        for &sample in &self.samples {
            let scaled = (sample as f64 * SAMPLE_SCALE)
                .clamp(-SAMPLE_SCALE, SAMPLE_SCALE) as i32;
            buf.put_i32(scaled);
        }
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, MediaError> {
        need(payload, 16)?;
        let mut cursor = payload;
        let batch_count = cursor.get_u32();
        let total_samples = cursor.get_u32();
        let sample_rate = cursor.get_u32();
        let channels = cursor.get_u32();
        if total_samples > MAX_BATCH_SAMPLES {
            return Err(MediaError::TooManySamples {
                count: total_samples,
                max: MAX_BATCH_SAMPLES,
            });
        }
        let body = total_samples as usize * 4;
        if cursor.len() != body {
            return Err(MediaError::SizeMismatch {
                declared: 16 + body,
                actual: payload.len(),
            });
        }
        let mut samples = Vec::with_capacity(total_samples as usize);
        for _ in 0..total_samples {
            samples.push((cursor.get_i32() as f64 / SAMPLE_SCALE) as f32);
        }
        Ok(Self {
            batch_count,
            sample_rate,
            channels,
            samples,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AUDIO_OPUS / AUDIO_OPUS_BATCH
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded `AUDIO_OPUS_BATCH`: shared parameters plus per-frame payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusBatch {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub frames: Vec<Bytes>,
}

impl OpusBatch {
    pub fn encode(&self) -> Bytes {
        let body: usize = self.frames.iter().map(|f| f.len()).sum();
        let mut buf = BytesMut::with_capacity(16 + self.frames.len() * 2 + body);
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.frame_duration_ms);
        buf.put_u32(self.frames.len() as u32);
        buf.put_u32(0); // reserved
        for frame in &self.frames {
            buf.put_u16(frame.len() as u16);
        }
        for frame in &self.frames {
            buf.put_slice(frame);
        }
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, MediaError> {
        need(&payload, 16)?;
        let mut cursor = &payload[..];
        let sample_rate = cursor.get_u32();
        let frame_duration_ms = cursor.get_u32();
        let frame_count = cursor.get_u32();
        let _reserved = cursor.get_u32();
        if frame_count > MAX_OPUS_FRAMES {
            return Err(MediaError::TooManyFrames {
                count: frame_count,
                max: MAX_OPUS_FRAMES,
            });
        }
        let sizes_len = frame_count as usize * 2;
        need(&payload, 16 + sizes_len)?;
        let mut sizes = Vec::with_capacity(frame_count as usize);
        for _ in 0..frame_count {
            sizes.push(cursor.get_u16() as usize);
        }
        let body: usize = sizes.iter().sum();
        if payload.len() != 16 + sizes_len + body {
            return Err(MediaError::SizeMismatch {
                declared: 16 + sizes_len + body,
                actual: payload.len(),
            });
        }
        let mut frames = Vec::with_capacity(frame_count as usize);
        let mut offset = 16 + sizes_len;
        for size in sizes {
            frames.push(payload.slice(offset..offset + size));
            offset += size;
        }
        Ok(Self {
            sample_rate,
            frame_duration_ms,
            frames,
        })
    }
}

/// Decoded single `AUDIO_OPUS` payload: 16-byte header then one Opus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpusSingle {
    pub sample_rate: u32,
    pub frame_duration_ms: u32,
    pub frame: Bytes,
}

impl OpusSingle {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(OPUS_SINGLE_HEADER + self.frame.len());
        buf.put_u32(self.sample_rate);
        buf.put_u32(self.frame_duration_ms);
        buf.put_u64(0); // reserved
        buf.put_slice(&self.frame);
        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, MediaError> {
        need(&payload, OPUS_SINGLE_HEADER)?;
        let mut cursor = &payload[..];
        let sample_rate = cursor.get_u32();
        let frame_duration_ms = cursor.get_u32();
        let _reserved = cursor.get_u64();
        Ok(Self {
            sample_rate,
            frame_duration_ms,
            frame: payload.slice(OPUS_SINGLE_HEADER..),
        })
    }
}

//! Combine-with-exclusion PCM mixing.
//!
//! The audio render worker reads every peer's ingress ring and sums the
//! samples; this module supplies the combine step plus the optional ducking
//! and soft-compression stage. In bypass mode (mixer disabled in config) the
//! worker performs a plain unclamped sum and none of this code runs.

use crate::buffers::SampleRing;
use crate::client::ClientId;

/// Sum amplitude above which the soft knee engages.
const KNEE_THRESHOLD: f32 = 0.8;

/// A dominant source ducks the others when its peak exceeds the runner-up by
/// this factor.
const DUCK_RATIO: f32 = 2.0;

/// Gain applied to non-dominant sources while ducking.
const DUCK_GAIN: f32 = 0.6;

/// One mixable source: a client id and its ingress ring.
pub struct MixSource<'a> {
    pub id: ClientId,
    pub ring: &'a SampleRing,
}

/// The ducking/compression mixer. Stateless today; the struct keeps the
/// call sites stable if per-stream gain smoothing lands later.
#[derive(Debug, Default)]
pub struct AudioMixer {
    ducking: bool,
}

impl AudioMixer {
    pub fn new(ducking: bool) -> Self {
        Self { ducking }
    }

    /// Mixes up to `out.len()` samples from every source except `excluded`.
    ///
    /// Returns the mix length: the maximum sample count obtained from any
    /// single source this tick. `out` beyond the returned length is zeroed.
    /// Output is soft-compressed and clipped to `[-1, 1]`.
    pub fn mix_excluding(
        &self,
        sources: &[MixSource<'_>],
        excluded: ClientId,
        out: &mut [f32],
    ) -> usize {
        out.fill(0.0);
        let mut scratch = vec![0.0f32; out.len()];
        let mut reads: Vec<(Vec<f32>, f32)> = Vec::with_capacity(sources.len());

        let mut mix_len = 0usize;
        for source in sources {
            if source.id == excluded {
                continue;
            }
            let count = source.ring.read(&mut scratch);
            if count == 0 {
                continue;
            }
            mix_len = mix_len.max(count);
            let peak = scratch[..count]
                .iter()
                .fold(0.0f32, |acc, s| acc.max(s.abs()));
            reads.push((scratch[..count].to_vec(), peak));
        }
        if reads.is_empty() {
            return 0;
        }

        let gains = self.ducking_gains(&reads);
        for ((samples, _), gain) in reads.iter().zip(gains) {
            for (slot, sample) in out.iter_mut().zip(samples) {
                *slot += sample * gain;
            }
        }
        soft_compress(&mut out[..mix_len]);
        mix_len
    }

    /// Per-source gains: unity, unless one source's peak is more than
    /// [`DUCK_RATIO`] times the runner-up's, in which case the rest duck.
    fn ducking_gains(&self, reads: &[(Vec<f32>, f32)]) -> Vec<f32> {
        if !self.ducking || reads.len() < 2 {
            return vec![1.0; reads.len()];
        }
        let mut peaks: Vec<f32> = reads.iter().map(|(_, peak)| *peak).collect();
        peaks.sort_by(|a, b| b.total_cmp(a));
        let (loudest, runner_up) = (peaks[0], peaks[1]);
        if runner_up <= f32::EPSILON || loudest < DUCK_RATIO * runner_up {
            return vec![1.0; reads.len()];
        }
        reads
            .iter()
            .map(|(_, peak)| if *peak >= loudest { 1.0 } else { DUCK_GAIN })
            .collect()
    }
}

/// Soft-knee compression above [`KNEE_THRESHOLD`], then a hard clamp.
///
/// Values inside the knee pass through untouched; excess amplitude is
/// squashed with a rational curve so simultaneous speakers stop crackling
/// without audibly pumping single voices.
pub fn soft_compress(samples: &mut [f32]) {
    for sample in samples {
        let magnitude = sample.abs();
        if magnitude > KNEE_THRESHOLD {
            let excess = magnitude - KNEE_THRESHOLD;
            let squashed = KNEE_THRESHOLD + excess / (1.0 + excess);
            *sample = sample.signum() * squashed.min(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(samples: &[f32]) -> SampleRing {
        let ring = SampleRing::new(4096);
        ring.write(samples);
        ring
    }

    #[test]
    fn excluded_source_never_reaches_the_mix() {
        let me = ClientId(1);
        let peer = ClientId(2);
        let my_ring = ring_with(&[0.9; 480]);
        let peer_ring = ring_with(&[0.1; 480]);

        let mixer = AudioMixer::new(false);
        let mut out = vec![0.0f32; 480];
        let sources = [
            MixSource { id: me, ring: &my_ring },
            MixSource { id: peer, ring: &peer_ring },
        ];
        let mixed = mixer.mix_excluding(&sources, me, &mut out);
        assert_eq!(mixed, 480);
        for sample in &out {
            assert!((sample - 0.1).abs() < 1e-6, "own audio leaked into mix");
        }
        // The excluded ring was not drained.
        assert_eq!(my_ring.available_read(), 480);
    }

    #[test]
    fn mix_length_is_max_of_source_reads() {
        let mixer = AudioMixer::new(false);
        let long = ring_with(&[0.2; 400]);
        let short = ring_with(&[0.3; 100]);
        let mut out = vec![0.0f32; 480];
        let sources = [
            MixSource { id: ClientId(1), ring: &long },
            MixSource { id: ClientId(2), ring: &short },
        ];
        let mixed = mixer.mix_excluding(&sources, ClientId(9), &mut out);
        assert_eq!(mixed, 400);
        assert!((out[50] - 0.5).abs() < 1e-6);
        assert!((out[200] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn empty_sources_produce_silence() {
        let mixer = AudioMixer::new(true);
        let empty = SampleRing::new(64);
        let mut out = vec![0.5f32; 64];
        let sources = [MixSource { id: ClientId(1), ring: &empty }];
        assert_eq!(mixer.mix_excluding(&sources, ClientId(2), &mut out), 0);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn output_is_clipped() {
        let mixer = AudioMixer::new(false);
        let loud_a = ring_with(&[0.9; 128]);
        let loud_b = ring_with(&[0.9; 128]);
        let mut out = vec![0.0f32; 128];
        let sources = [
            MixSource { id: ClientId(1), ring: &loud_a },
            MixSource { id: ClientId(2), ring: &loud_b },
        ];
        mixer.mix_excluding(&sources, ClientId(9), &mut out);
        assert!(out.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn dominant_source_ducks_the_rest() {
        let mixer = AudioMixer::new(true);
        let dominant = ring_with(&[0.8; 64]);
        let quiet = ring_with(&[0.1; 64]);
        let mut out = vec![0.0f32; 64];
        let sources = [
            MixSource { id: ClientId(1), ring: &dominant },
            MixSource { id: ClientId(2), ring: &quiet },
        ];
        mixer.mix_excluding(&sources, ClientId(9), &mut out);
        // 0.8 + 0.1 * DUCK_GAIN = 0.86, inside the knee... 0.86 > 0.8 so the
        // knee engages: expect strictly less than the plain sum of 0.9.
        assert!(out[0] < 0.9);
        assert!(out[0] > 0.8);
    }

    #[test]
    fn soft_compress_is_identity_inside_knee() {
        let mut samples = vec![0.0, 0.25, -0.5, 0.79, -0.79];
        let original = samples.clone();
        soft_compress(&mut samples);
        assert_eq!(samples, original);
    }

    #[test]
    fn soft_compress_monotone_and_bounded() {
        let mut previous = 0.0f32;
        for step in 0..100 {
            let mut sample = [step as f32 * 0.05];
            soft_compress(&mut sample);
            assert!(sample[0] >= previous);
            assert!(sample[0] <= 1.0);
            previous = sample[0];
        }
    }
}

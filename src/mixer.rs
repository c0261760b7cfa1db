//! Additive mixer feeding one hardware burst from many client rings.
use tracing::trace;

use crate::ring::SharedRingBuffer;

/// Sums up to one burst from each running channel into a float accumulator.
///
/// The accumulator is allocated once. Output is not clipped: overlapping loud channels can
/// exceed full scale, and limiting is left to the hardware write path.
pub struct MixEngine {
    channel_count: usize,
    frames_per_burst: usize,
    accumulator: Vec<f32>,
}

impl MixEngine {
    /// Engine for bursts of `frames_per_burst` frames with `channel_count` samples each.
    pub fn new(channel_count: usize, frames_per_burst: usize) -> Self {
        Self {
            channel_count,
            frames_per_burst,
            accumulator: vec![0.0; channel_count * frames_per_burst],
        }
    }

    /// Samples per frame.
    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    /// Frames per burst.
    pub fn frames_per_burst(&self) -> usize {
        self.frames_per_burst
    }

    /// Zero the accumulator before a burst.
    pub fn clear(&mut self) {
        self.accumulator.fill(0.0);
    }

    /// Add up to one burst from `ring`, scaled by `volume`, and consume what was used.
    ///
    /// Returns `true` when fewer than a full burst was available; the missing tail contributes
    /// silence. `index` only labels trace output.
    pub fn mix(&mut self, index: usize, ring: &SharedRingBuffer, volume: f32) -> bool {
        debug_assert_eq!(ring.channels(), self.channel_count);
        let (frames, underflowed) = self.accumulate(ring, volume);
        if underflowed {
            trace!(
                index,
                frames,
                wanted = self.frames_per_burst,
                "mix underflow"
            );
        }
        underflowed
    }

    /// Like [`Self::mix`] but also reports how many frames were consumed.
    pub(crate) fn accumulate(&mut self, ring: &SharedRingBuffer, volume: f32) -> (usize, bool) {
        let (first, second) = ring.readable_regions(self.frames_per_burst);
        let samples = first.len() + second.len();
        let frames = samples / self.channel_count;

        let (head, tail) = self.accumulator.split_at_mut(first.len());
        add_scaled(head, first, volume);
        add_scaled(&mut tail[..second.len()], second, volume);

        ring.advance_read(frames);
        (frames, frames < self.frames_per_burst)
    }

    /// Mixed burst, interleaved.
    pub fn output_buffer(&self) -> &[f32] {
        &self.accumulator
    }

    /// Mixed burst for in-place post-processing.
    pub fn output_buffer_mut(&mut self) -> &mut [f32] {
        &mut self.accumulator
    }
}

fn add_scaled(dest: &mut [f32], src: &[f32], volume: f32) {
    if volume == 1.0 {
        for (d, s) in dest.iter_mut().zip(src) {
            *d += *s;
        }
    } else {
        for (d, s) in dest.iter_mut().zip(src) {
            *d += *s * volume;
        }
    }
}

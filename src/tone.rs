//! Sine test tones for demo producers and self-tests.
use dasp_signal::{self as signal, Signal};

/// Interleaved sine generator that writes the same value to every channel of a frame.
pub struct ToneSource {
    signal: signal::Sine<signal::ConstHz>,
    channels: usize,
    amplitude: f32,
}

impl ToneSource {
    /// `frequency_hz` tone at `amplitude` (linear, 0-1) for `channels`-channel frames.
    pub fn new(sample_rate: u32, frequency_hz: f64, amplitude: f32, channels: usize) -> Self {
        let sine = signal::rate(sample_rate as f64).const_hz(frequency_hz).sine();
        Self {
            signal: sine,
            channels: channels.max(1),
            amplitude,
        }
    }

    /// Fill `out` with whole frames. Returns frames written.
    pub fn fill(&mut self, out: &mut [f32]) -> usize {
        let mut frames = 0;
        for frame in out.chunks_exact_mut(self.channels) {
            let value = self.signal.next() as f32 * self.amplitude;
            frame.fill(value);
            frames += 1;
        }
        frames
    }

    /// `frames` frames in a new buffer.
    pub fn render(&mut self, frames: usize) -> Vec<f32> {
        let mut buffer = vec![0.0; frames * self.channels];
        self.fill(&mut buffer);
        buffer
    }
}

/// Root mean square of a sample block.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let energy: f32 = samples.iter().map(|s| s * s).sum();
    (energy / samples.len() as f32).sqrt()
}

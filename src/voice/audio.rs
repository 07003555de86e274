//! PCM transforms for the voice pipeline.
//!
//! Discord speaks 48 kHz stereo in 20 ms ticks; the realtime model takes
//! 16 kHz mono in 100 ms frames and answers with 24 kHz mono. Everything
//! here is pure sample math so it can be tested without a voice connection.

use std::collections::VecDeque;

/// Samples per channel in one 20 ms Discord tick (48 kHz).
pub const DISCORD_TICK_SAMPLES: usize = 960;

/// One 100 ms model input frame: 1600 samples at 16 kHz, 2 bytes each.
pub const MODEL_FRAME_SAMPLES: usize = 1600;
pub const MODEL_FRAME_BYTES: usize = MODEL_FRAME_SAMPLES * 2;

/// Downmix 48 kHz interleaved stereo to 16 kHz mono.
///
/// Nearest-neighbor 3:1 subsampling; each kept frame averages L and R.
pub fn downmix_48k_stereo_to_16k_mono(samples: &[i16]) -> Vec<i16> {
    let frames = samples.len() / 2;
    let out_len = frames / 3;
    let mut out = Vec::with_capacity(out_len);
    for index in 0..out_len {
        let frame = index * 3;
        let left = samples[frame * 2] as i32;
        let right = samples[frame * 2 + 1] as i32;
        out.push(((left + right) / 2) as i16);
    }
    out
}

/// Upsample 24 kHz mono to 48 kHz interleaved stereo by sample doubling and
/// channel duplication.
pub fn upsample_24k_mono_to_48k_stereo(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for &sample in samples {
        // Two output frames per input sample, both channels identical.
        out.extend_from_slice(&[sample, sample, sample, sample]);
    }
    out
}

pub fn pcm_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn i16_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Buffers bytes and emits exact fixed-size frames.
///
/// A trailing partial frame is dropped on flush, never emitted.
pub struct Framer {
    frame_bytes: usize,
    buffer: Vec<u8>,
}

impl Framer {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes,
            buffer: Vec::with_capacity(frame_bytes * 2),
        }
    }

    /// Append bytes; returns every whole frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_bytes {
            let rest = self.buffer.split_off(self.frame_bytes);
            frames.push(std::mem::replace(&mut self.buffer, rest));
        }
        frames
    }

    /// Drop any buffered partial frame.
    pub fn flush(&mut self) {
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// FIFO of encoded packets feeding the paced sender.
#[derive(Default)]
pub struct PacketQueue {
    packets: VecDeque<Vec<u8>>,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Vec<u8>) {
        self.packets.push_back(packet);
    }

    pub fn pop(&mut self) -> Option<Vec<u8>> {
        self.packets.pop_front()
    }

    /// Drop everything queued (model interrupt).
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downmix_length_matches_the_ratio() {
        // N bytes of 48k/2ch/16-bit in → floor(N / (2·2·3)) · 2 bytes out.
        for &frames in &[960usize, 961, 959, 480, 7] {
            let samples = vec![0i16; frames * 2];
            let out = downmix_48k_stereo_to_16k_mono(&samples);
            let input_bytes = frames * 2 * 2;
            assert_eq!(out.len() * 2, (input_bytes / 12) * 2, "frames={frames}");
        }
    }

    #[test]
    fn downmix_averages_the_channels() {
        // One kept frame: L=100, R=200 → 150.
        let samples = [100i16, 200, 0, 0, 0, 0];
        let out = downmix_48k_stereo_to_16k_mono(&samples);
        assert_eq!(out, vec![150]);
    }

    #[test]
    fn upsample_doubles_and_duplicates() {
        let out = upsample_24k_mono_to_48k_stereo(&[7, -3]);
        assert_eq!(out, vec![7, 7, 7, 7, -3, -3, -3, -3]);
    }

    #[test]
    fn pcm_byte_round_trip() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        assert_eq!(pcm_bytes_to_i16(&i16_to_pcm_bytes(&samples)), samples);
    }

    #[test]
    fn framer_emits_exact_frames() {
        let mut framer = Framer::new(10);
        assert!(framer.push(&[0u8; 7]).is_empty());
        let frames = framer.push(&[0u8; 14]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|frame| frame.len() == 10));
        assert_eq!(framer.buffered(), 1);
    }

    #[test]
    fn framer_flush_drops_the_partial() {
        let mut framer = Framer::new(MODEL_FRAME_BYTES);
        framer.push(&[0u8; 100]);
        assert_eq!(framer.buffered(), 100);
        framer.flush();
        assert_eq!(framer.buffered(), 0);
        assert!(framer.push(&[]).is_empty());
    }

    #[test]
    fn packet_queue_is_fifo_and_clearable() {
        let mut queue = PacketQueue::new();
        queue.push(vec![1]);
        queue.push(vec![2]);
        assert_eq!(queue.pop(), Some(vec![1]));
        queue.push(vec![3]);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn a_full_second_of_ticks_frames_into_ten_model_frames() {
        let mut framer = Framer::new(MODEL_FRAME_BYTES);
        let mut frames = Vec::new();
        // 50 × 20 ms ticks of 48 kHz stereo.
        for _ in 0..50 {
            let tick = vec![0i16; DISCORD_TICK_SAMPLES * 2];
            let mono = downmix_48k_stereo_to_16k_mono(&tick);
            assert_eq!(mono.len(), 320);
            frames.extend(framer.push(&i16_to_pcm_bytes(&mono)));
        }
        assert_eq!(frames.len(), 10);
    }
}

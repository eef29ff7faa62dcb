//! Pre-allocated per-session audio buffer.
//!
//! Capacity is fixed at construction (max audio duration x sample rate) and
//! never reallocates on the hot path. When an append would overflow, the
//! buffer shifts left by the incoming length: recency wins, ordering is
//! preserved, and the oldest samples are dropped.

pub struct PreallocatedRingBuffer {
    buffer: Vec<f32>,
    write_ptr: usize,
}

impl PreallocatedRingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0.0; capacity.max(1)],
            write_ptr: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn len(&self) -> usize {
        self.write_ptr
    }

    pub fn is_empty(&self) -> bool {
        self.write_ptr == 0
    }

    /// Append samples, shifting out exactly `samples.len()` oldest samples
    /// if the buffer is full.
    pub fn push(&mut self, samples: &[f32]) {
        let capacity = self.capacity();

        // A chunk larger than the whole buffer keeps only its newest tail.
        if samples.len() >= capacity {
            let tail = &samples[samples.len() - capacity..];
            self.buffer.copy_from_slice(tail);
            self.write_ptr = capacity;
            return;
        }

        if self.write_ptr + samples.len() > capacity {
            let shift = samples.len();
            self.buffer.copy_within(shift.., 0);
            self.write_ptr -= shift;
        }

        self.buffer[self.write_ptr..self.write_ptr + samples.len()].copy_from_slice(samples);
        self.write_ptr += samples.len();
    }

    /// The occupied window.
    pub fn occupied(&self) -> &[f32] {
        &self.buffer[..self.write_ptr]
    }

    /// Copy the occupied window out for a transcription snapshot.
    pub fn snapshot(&self) -> Vec<f32> {
        self.occupied().to_vec()
    }

    /// Soft reset: the next append starts from zero.
    pub fn clear(&mut self) {
        self.write_ptr = 0;
    }
}

/// Decode signed 16-bit little-endian PCM into float32 samples in [-1, 1].
pub fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Re-encode float samples as signed 16-bit little-endian PCM.
pub fn f32_to_pcm_s16le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        bytes.extend_from_slice(&clamped.to_le_bytes());
    }
    bytes
}

//! Audio formats, device parameters and the visualization sample ring.
//! Device output is interleaved PCM f32.

/// Sample formats a decoder may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16,
    S32,
    F32,
    F64,
    U8P,
    S16P,
    S32P,
    F32P,
    F64P,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 | SampleFormat::U8P => 1,
            SampleFormat::S16 | SampleFormat::S16P => 2,
            SampleFormat::S32 | SampleFormat::S32P | SampleFormat::F32 | SampleFormat::F32P => 4,
            SampleFormat::F64 | SampleFormat::F64P => 8,
        }
    }

    pub fn is_planar(self) -> bool {
        matches!(
            self,
            SampleFormat::U8P | SampleFormat::S16P | SampleFormat::S32P | SampleFormat::F32P | SampleFormat::F64P
        )
    }
}

/// Format of a chunk of PCM: the decoder's source format or the device's
/// target format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

/// Parameters of the opened output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bytes per interleaved frame of f32 samples.
    pub frame_size: usize,
    pub bytes_per_sec: usize,
    /// Device buffer size in bytes.
    pub hw_buf_size: usize,
}

impl AudioParams {
    pub fn new(sample_rate: u32, channels: u16, buffer_samples: u32) -> Self {
        let frame_size = channels as usize * std::mem::size_of::<f32>();
        Self {
            sample_rate,
            channels,
            frame_size,
            bytes_per_sec: sample_rate as usize * frame_size,
            hw_buf_size: buffer_samples as usize * frame_size,
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::F32,
        }
    }

    /// Seconds of audio held by `bytes` of output.
    pub fn bytes_to_seconds(&self, bytes: usize) -> f64 {
        if self.bytes_per_sec == 0 {
            return 0.0;
        }
        bytes as f64 / self.bytes_per_sec as f64
    }
}

/// Ring of recently played mono-mixed samples for the waveform display.
#[derive(Debug, Clone)]
pub struct SampleArray {
    samples: Vec<f32>,
    index: usize,
}

/// Capacity of the visualization ring, in samples.
pub const SAMPLE_ARRAY_SIZE: usize = 8 * 65536;

impl SampleArray {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            index: 0,
        }
    }

    /// Append interleaved samples (all channels are kept interleaved).
    pub fn push(&mut self, samples: &[f32]) {
        let capacity = self.samples.len();
        for &sample in samples {
            self.samples[self.index] = sample;
            self.index = (self.index + 1) % capacity;
        }
    }

    /// The most recent `count` samples in chronological order.
    pub fn latest(&self, count: usize) -> Vec<f32> {
        let capacity = self.samples.len();
        let count = count.min(capacity);
        let start = (self.index + capacity - count) % capacity;
        (0..count).map(|i| self.samples[(start + i) % capacity]).collect()
    }

    pub fn clear(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = 0.0);
        self.index = 0;
    }
}

impl Default for SampleArray {
    fn default() -> Self {
        Self::new(SAMPLE_ARRAY_SIZE)
    }
}

//! Rate conversion for playback speed and device rate.
//!
//! Uses Rubato to convert interleaved `f32` audio from the track's effective rate
//! (`frequency * speed`) to the output device rate. Runs inline on the mixer thread: input
//! is buffered until a full chunk is available, and [`SpeedResampler::flush`] pushes the tail.

use anyhow::{Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

/// Streaming sinc resampler with an internal input accumulator.
pub struct SpeedResampler {
    resampler: Box<dyn Resampler<f32>>,
    channels: usize,
    chunk_frames: usize,
    input: Vec<f32>,
    scratch: Vec<f32>,
}

/// Source rate the output has to consume per second at `speed`.
pub fn effective_rate(frequency: u32, speed: f64) -> f64 {
    let speed = if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        1.0
    };
    f64::from(frequency) * speed
}

/// Whether playing `frequency` at `speed` on a `dst_rate` device needs conversion.
pub fn needs_resampling(frequency: u32, speed: f64, dst_rate: u32) -> bool {
    (effective_rate(frequency, speed) - f64::from(dst_rate)).abs() > f64::EPSILON
}

impl SpeedResampler {
    pub fn new(src_rate: f64, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if !(src_rate.is_finite() && src_rate > 0.0) || dst_rate == 0 || channels == 0 {
            return Err(anyhow!(
                "invalid resampler shape: {src_rate} Hz -> {dst_rate} Hz, {channels} channels"
            ));
        }
        let sinc_len = 128;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Cubic,
            oversampling_factor: 256,
            window,
        };

        let chunk_frames = chunk_frames.max(1);
        let resampler: Box<dyn Resampler<f32>> = Box::new(
            Async::<f32>::new_sinc(
                f64::from(dst_rate) / src_rate,
                1.1,
                &params,
                chunk_frames,
                channels,
                FixedAsync::Input,
            )
            .map_err(|e| anyhow!("resampler init error: {e}"))?,
        );
        let scratch = vec![0.0f32; channels * resampler.output_frames_max()];

        Ok(Self {
            resampler,
            channels,
            chunk_frames,
            input: Vec::new(),
            scratch,
        })
    }

    /// Feed interleaved samples; converted output is appended to `out`.
    pub fn process(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.input.extend_from_slice(samples);
        let chunk_samples = self.chunk_frames * self.channels;
        if self.input.len() < chunk_samples {
            return Ok(());
        }

        let mut input = std::mem::take(&mut self.input);
        let mut consumed = 0;
        while input.len() - consumed >= chunk_samples {
            self.run_chunk(&input[consumed..consumed + chunk_samples], None, out)?;
            consumed += chunk_samples;
        }
        input.drain(..consumed);
        self.input = input;
        Ok(())
    }

    /// Convert whatever is still buffered, zero-padded to a full chunk.
    pub fn flush(&mut self, out: &mut Vec<f32>) -> Result<()> {
        let tail_frames = self.input.len() / self.channels;
        if tail_frames == 0 {
            self.input.clear();
            return Ok(());
        }
        let mut padded = std::mem::take(&mut self.input);
        padded.resize(self.chunk_frames * self.channels, 0.0);
        self.run_chunk(&padded, Some(tail_frames), out)
    }

    fn run_chunk(&mut self, chunk: &[f32], partial_len: Option<usize>, out: &mut Vec<f32>) -> Result<()> {
        let frames = chunk.len() / self.channels;
        let input_adapter = InterleavedSlice::new(chunk, self.channels, frames)
            .map_err(|e| anyhow!("interleaved slice (input) error: {e}"))?;
        let out_capacity_frames = self.scratch.len() / self.channels;
        let mut output_adapter =
            InterleavedSlice::new_mut(&mut self.scratch, self.channels, out_capacity_frames)
                .map_err(|e| anyhow!("interleaved slice (output) error: {e}"))?;

        let indexing = Indexing {
            input_offset: 0,
            output_offset: 0,
            active_channels_mask: None,
            partial_len,
        };
        let (_nbr_in, nbr_out) = self
            .resampler
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&indexing))
            .map_err(|e| anyhow!("resampler process error: {e}"))?;

        out.extend_from_slice(&self.scratch[..nbr_out * self.channels]);
        Ok(())
    }
}

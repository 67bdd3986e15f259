//! cpal output stream for one playback.
//!
//! The callback pulls interleaved `f32` at the device rate from a [`SharedAudio`] queue,
//! maps channels onto the device layout and converts to the device sample format. It never
//! waits: an empty queue plays silence, and a paused playback plays silence without draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::queue::SharedAudio;

/// Shared controls between the mixer thread and the output callback.
#[derive(Clone, Debug)]
pub struct OutputOptions {
    /// Max frames pulled from the queue per refill.
    pub refill_max_frames: usize,
    /// When `true` the callback outputs silence and leaves the queue untouched.
    pub paused: Arc<AtomicBool>,
    /// Incremented by the number of queued frames actually played.
    pub played_frames: Arc<AtomicU64>,
}

/// Build a (not yet started) output stream fed from `queue`.
pub fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SharedAudio>,
    opts: OutputOptions,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue, opts),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue, opts),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue, opts),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue, opts),
        other => Err(anyhow!("Unsupported sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
    opts: OutputOptions,
) -> Result<cpal::Stream>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let dst_channels = usize::from(config.channels).max(1);
    let src_channels = queue.channels();
    let refill_max_frames = opts.refill_max_frames.max(1);
    let queue_cb = queue.clone();
    let mut local = LocalBuffer::default();

    let err_fn = |err| tracing::warn!("stream error: {err}");

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let silence = <T as cpal::Sample>::from_sample::<f32>(0.0);
            if opts.paused.load(Ordering::Relaxed) {
                data.fill(silence);
                return;
            }

            let mut played = 0u64;
            for out_frame in data.chunks_mut(dst_channels) {
                let Some(frame) = local.next_frame(&queue_cb, src_channels, refill_max_frames)
                else {
                    out_frame.fill(silence);
                    continue;
                };
                for (ch, slot) in out_frame.iter_mut().enumerate() {
                    *slot = <T as cpal::Sample>::from_sample::<f32>(mapped_sample(
                        frame,
                        dst_channels,
                        ch,
                    ));
                }
                played += 1;
            }

            if played > 0 {
                opts.played_frames.fetch_add(played, Ordering::Relaxed);
            }
        },
        err_fn,
        None,
    )?;

    Ok(stream)
}

/// Callback-owned slice of the queue so the lock is taken once per refill.
#[derive(Default)]
struct LocalBuffer {
    samples: Vec<f32>,
    pos: usize,
}

impl LocalBuffer {
    fn next_frame(&mut self, queue: &SharedAudio, channels: usize, refill: usize) -> Option<&[f32]> {
        if self.pos + channels > self.samples.len() {
            self.samples = queue.pop_up_to(refill)?;
            self.pos = 0;
        }
        let start = self.pos;
        self.pos += channels;
        self.samples.get(start..start + channels)
    }
}

/// Sample for output channel `dst_ch` taken from one interleaved source frame.
///
/// Mono is duplicated, stereo to mono is averaged, other layouts clamp to the last
/// available source channel.
pub fn mapped_sample(frame: &[f32], dst_channels: usize, dst_ch: usize) -> f32 {
    match (frame.len(), dst_channels) {
        (0, _) => 0.0,
        (1, _) => frame[0],
        (2, 1) => 0.5 * (frame[0] + frame[1]),
        (n, _) => frame[dst_ch.min(n - 1)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_is_duplicated() {
        assert_eq!(mapped_sample(&[0.5], 2, 0), 0.5);
        assert_eq!(mapped_sample(&[0.5], 2, 1), 0.5);
    }

    #[test]
    fn stereo_to_mono_averages() {
        assert_eq!(mapped_sample(&[0.25, 0.75], 1, 0), 0.5);
    }

    #[test]
    fn wider_output_clamps_to_last_channel() {
        let frame = [0.1, 0.2];
        assert_eq!(mapped_sample(&frame, 4, 0), 0.1);
        assert_eq!(mapped_sample(&frame, 4, 1), 0.2);
        assert_eq!(mapped_sample(&frame, 4, 3), 0.2);
    }

    #[test]
    fn empty_frame_is_silent() {
        assert_eq!(mapped_sample(&[], 2, 0), 0.0);
    }

    #[test]
    fn local_buffer_refills_from_queue() {
        let queue = SharedAudio::new(2, 16);
        queue.try_push_interleaved(&[1.0, 2.0, 3.0, 4.0]);
        let mut local = LocalBuffer::default();

        assert_eq!(local.next_frame(&queue, 2, 1), Some(&[1.0, 2.0][..]));
        assert_eq!(local.next_frame(&queue, 2, 1), Some(&[3.0, 4.0][..]));
        assert_eq!(local.next_frame(&queue, 2, 1), None);
    }
}

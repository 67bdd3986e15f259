//! Bounded queue of interleaved samples between the mixer thread and the output callback.
//!
//! Neither side ever waits: the mixer tops the queue up with whatever fits and keeps the
//! remainder, the callback takes whatever is buffered and plays silence otherwise.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Thread-safe bounded queue for interleaved `f32` audio samples.
///
/// The channel count is fixed for the lifetime of the queue; capacity is counted in
/// samples. A closed queue accepts no more input but keeps its contents until drained.
pub struct SharedAudio {
    channels: usize,
    max_buffered_samples: usize,
    inner: Mutex<SharedInner>,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Compute a conservative queue capacity in **samples** for a `(rate, channels, seconds)` target.
///
/// Non-finite or non-positive `buffer_seconds` fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            max_buffered_samples: max_buffered_samples.max(channels),
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                done: false,
            }),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Current buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.inner.lock().unwrap().queue.len() / self.channels
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Closed by the producer and fully consumed.
    pub fn is_drained(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.done && g.queue.is_empty()
    }

    /// Mark the end of input. Idempotent.
    pub fn close(&self) {
        self.inner.lock().unwrap().done = true;
    }

    /// Append as many whole frames from `samples` as fit and return how many samples were taken.
    ///
    /// Returns 0 once the queue is closed.
    pub fn try_push_interleaved(&self, samples: &[f32]) -> usize {
        let mut g = self.inner.lock().unwrap();
        if g.done {
            return 0;
        }
        let room = self.max_buffered_samples.saturating_sub(g.queue.len());
        let take = (room.min(samples.len()) / self.channels) * self.channels;
        g.queue.extend(&samples[..take]);
        take
    }

    /// Remove up to `max_frames` whole frames. `None` when nothing is buffered.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let frames = (g.queue.len() / self.channels).min(max_frames);
        if frames == 0 {
            return None;
        }
        Some(g.queue.drain(..frames * self.channels).collect())
    }
}

use std::time::Duration;

use serde::Deserialize;

/// Tuning for [`LocalMixer`](crate::mixer::local::LocalMixer).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct MixerConfig {
    /// Output device substring; `None` picks the host default.
    pub device: Option<String>,
    /// Resampler chunk size in frames.
    pub chunk_frames: usize,
    /// Max frames pulled per output callback refill.
    pub refill_max_frames: usize,
    /// Target buffer duration for output queue sizing.
    pub buffer_seconds: f32,
    /// How often playing tracks publish their position.
    pub report_interval_ms: u64,
}

impl MixerConfig {
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms.max(1))
    }
}

impl Default for MixerConfig {
    /// Defaults tuned for low-risk playback across common devices.
    fn default() -> Self {
        Self {
            device: None,
            chunk_frames: 1024,
            refill_max_frames: 4096,
            buffer_seconds: 2.0,
            report_interval_ms: 50,
        }
    }
}

//! File demuxing with symphonia.
//!
//! Probes a local file, optionally seeks, and yields the packets of its default track as
//! [`Packet`]s ready for an [`audio_track::AudioTrack`].

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use audio_track::decode::{codec_name_from_params, open_stream};
use audio_track::{Packet, Stream};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;

/// Packet source for one track of an opened file.
pub struct Demuxer {
    format: Box<dyn FormatReader>,
    track_id: u32,
}

/// Open `path`, seek to `position_ms` when positive and build the decode context of its
/// default track.
pub fn open(path: &Path, position_ms: i64) -> Result<(Demuxer, Stream)> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("probe input")?;
    let mut format = probed.format;

    if let Some(time) = seek_time(position_ms) {
        if let Err(e) = format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: None,
            },
        ) {
            tracing::warn!(position_ms, "seek failed, playing from the start: {e}");
        }
    }

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("No default audio track"))?;
    let track_id = track.id;
    tracing::info!(
        path = %path.display(),
        track = track_id,
        codec = codec_name_from_params(&track.codec_params).unwrap_or_else(|| "unknown".into()),
        "input opened"
    );
    let stream = open_stream(track)?;

    Ok((Demuxer { format, track_id }, stream))
}

impl Demuxer {
    /// Next packet of the selected track; `None` at end of file.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            match self.format.next_packet() {
                Ok(packet) if packet.track_id() != self.track_id => continue,
                Ok(packet) => return Ok(Some(Packet::from(packet))),
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    tracing::warn!("stream parameters changed; stopping at this point");
                    return Ok(None);
                }
                Err(e) => return Err(e).context("read packet"),
            }
        }
    }
}

fn seek_time(position_ms: i64) -> Option<Time> {
    if position_ms <= 0 {
        return None;
    }
    let ms = position_ms as u64;
    Some(Time::new(ms / 1000, (ms % 1000) as f64 / 1000.0))
}

/// Whether a packet at `packet_ms` is more than `lead_ms` ahead of `position_ms`.
pub fn is_too_far_ahead(packet_ms: i64, position_ms: i64, lead_ms: u64) -> bool {
    packet_ms.saturating_sub(position_ms) > i64::try_from(lead_ms).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_time_splits_seconds() {
        assert!(seek_time(0).is_none());
        assert!(seek_time(-5).is_none());
        let t = seek_time(2_250).unwrap();
        assert_eq!(t.seconds, 2);
        assert!((t.frac - 0.25).abs() < 1e-9);
    }

    #[test]
    fn lead_window() {
        assert!(!is_too_far_ahead(1_000, 0, 1_500));
        assert!(!is_too_far_ahead(1_500, 0, 1_500));
        assert!(is_too_far_ahead(1_501, 0, 1_500));
        assert!(!is_too_far_ahead(0, 5_000, 1_500));
        assert!(!is_too_far_ahead(i64::MAX, 0, u64::MAX));
    }

    #[test]
    fn open_missing_file_fails_with_context() {
        let err = open(Path::new("/nonexistent/input.flac"), 0).err().unwrap();
        assert!(format!("{err:#}").contains("open"));
    }
}

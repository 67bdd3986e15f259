//! Symphonia-backed decode context.
//!
//! [`SymphoniaDecoder`] adapts a symphonia codec decoder to the packet-in / frame-out
//! [`FrameDecoder`] contract, and [`open_stream`] builds a [`Stream`] from a probed track.

use std::collections::VecDeque;

use anyhow::{Context, Result, anyhow};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Track;

use crate::packet::Packet;
use crate::stream::{DecodeError, DecodedFrame, FrameDecoder, ReadError, Stream, TimeBase};

/// [`FrameDecoder`] over a symphonia codec.
///
/// Symphonia decodes one packet into one buffer, so frames are produced eagerly on
/// `send_packet` and handed out in order by `receive_frame`.
pub struct SymphoniaDecoder {
    decoder: Box<dyn Decoder>,
    pending: VecDeque<DecodedFrame>,
    draining: bool,
}

impl SymphoniaDecoder {
    pub fn new(params: &CodecParameters) -> Result<Self> {
        let decoder = symphonia::default::get_codecs()
            .make(params, &DecoderOptions::default())
            .context("create codec decoder")?;
        Ok(Self {
            decoder,
            pending: VecDeque::new(),
            draining: false,
        })
    }
}

impl FrameDecoder for SymphoniaDecoder {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        let Some(fields) = packet.fields() else {
            self.draining = true;
            return Ok(());
        };
        let input = fields.to_symphonia();

        let outcome = match self.decoder.decode(&input) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                let mut buf = SampleBuffer::<f32>::new(decoded.frames() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                Ok(DecodedFrame {
                    pts: fields.pts,
                    channels: spec.channels.count(),
                    samples: buf.samples().to_vec(),
                })
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(frame) => {
                self.pending.push_back(frame);
                Ok(())
            }
            Err(SymphoniaError::DecodeError(msg)) => {
                tracing::warn!(pts = ?fields.pts, "dropping undecodable packet: {msg}");
                Ok(())
            }
            Err(SymphoniaError::ResetRequired) => {
                tracing::debug!("codec reset requested");
                self.decoder.reset();
                Ok(())
            }
            Err(e) => Err(DecodeError::Codec(e.to_string())),
        }
    }

    fn receive_frame(&mut self) -> Result<DecodedFrame, ReadError> {
        match self.pending.pop_front() {
            Some(frame) => Ok(frame),
            None if self.draining => Err(ReadError::EndOfStream),
            None => Err(ReadError::NeedMoreInput),
        }
    }
}

/// Build a decode context for a probed symphonia track.
pub fn open_stream(track: &Track) -> Result<Stream> {
    let params = &track.codec_params;
    let frequency = params
        .sample_rate
        .ok_or_else(|| anyhow!("Unknown sample rate"))?;
    let time_base = params
        .time_base
        .map(TimeBase::from)
        .unwrap_or_else(|| TimeBase::new(1, frequency));
    let duration = duration_ms_from_codec_params(params)
        .and_then(|ms| i64::try_from(ms).ok())
        .unwrap_or_else(|| {
            tracing::debug!(track = track.id, "duration unknown");
            0
        });

    let decoder = SymphoniaDecoder::new(params)?;
    tracing::info!(
        track = track.id,
        codec = codec_name_from_params(params).as_deref().unwrap_or("unknown"),
        rate_hz = frequency,
        duration_ms = duration,
        "stream opened"
    );
    Ok(Stream::new(
        Box::new(decoder),
        track.id,
        time_base,
        duration,
        frequency,
    ))
}

/// Best-effort duration in milliseconds from codec metadata.
///
/// Returns `None` if the container does not provide total frames or sample rate.
pub fn duration_ms_from_codec_params(codec_params: &CodecParameters) -> Option<u64> {
    let frames = codec_params.n_frames?;
    let rate = codec_params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

/// Best-effort codec label used for logging.
pub fn codec_name_from_params(params: &CodecParameters) -> Option<String> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "VORBIS",
        CODEC_TYPE_OPUS => "OPUS",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return None,
    };
    Some(name.to_string())
}

//! Per-track decode context.
//!
//! A [`Stream`] bundles the codec decoder, the most recently decoded frame and the immutable
//! stream facts (index, time base, duration, sample rate). The track owns it until the first
//! frame is found; at that point the decoder and the frame move to the playback sink.

use thiserror::Error;

use crate::packet::Packet;

/// Rational time base: one tick equals `numer / denom` seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeBase {
    pub numer: u32,
    pub denom: u32,
}

impl TimeBase {
    pub fn new(numer: u32, denom: u32) -> Self {
        Self { numer, denom }
    }

    /// Convert a tick count to milliseconds, rounding to nearest (ties away from zero).
    ///
    /// Returns `None` for a zero denominator or when the result does not fit in `i64`.
    pub fn ticks_to_ms(&self, ticks: i64) -> Option<i64> {
        if self.denom == 0 {
            return None;
        }
        let num = i128::from(ticks) * i128::from(self.numer) * 1000;
        let den = i128::from(self.denom);
        let half = den / 2;
        let rounded = if num >= 0 {
            (num + half) / den
        } else {
            (num - half) / den
        };
        i64::try_from(rounded).ok()
    }
}

impl From<symphonia::core::units::TimeBase> for TimeBase {
    fn from(tb: symphonia::core::units::TimeBase) -> Self {
        Self::new(tb.numer, tb.denom)
    }
}

/// Codec-level failure.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder already handed over")]
    Detached,
    #[error("codec error: {0}")]
    Codec(String),
}

/// Outcome of pulling a frame that did not produce one.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The decoder needs another packet before it can emit a frame.
    #[error("decoder needs more input")]
    NeedMoreInput,
    /// The decoder was drained and will not produce more frames.
    #[error("end of stream")]
    EndOfStream,
    #[error(transparent)]
    Failed(#[from] DecodeError),
}

/// A decoded block of interleaved `f32` samples.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedFrame {
    /// Presentation timestamp in stream ticks; `None` when the decoder could not resolve it.
    pub pts: Option<i64>,
    pub channels: usize,
    pub samples: Vec<f32>,
}

impl DecodedFrame {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels
        }
    }
}

/// Packet-in / frame-out codec interface.
///
/// Sending the empty packet switches the decoder to draining; once drained
/// [`FrameDecoder::receive_frame`] reports [`ReadError::EndOfStream`].
pub trait FrameDecoder: Send {
    fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError>;

    fn receive_frame(&mut self) -> Result<DecodedFrame, ReadError>;
}

/// Decode context for one audio stream.
pub struct Stream {
    pub decoder: Option<Box<dyn FrameDecoder>>,
    pub frame: Option<DecodedFrame>,
    pub index: u32,
    pub time_base: TimeBase,
    /// Stream duration in milliseconds.
    pub duration: i64,
    /// Sample rate in Hz.
    pub frequency: u32,
}

impl Stream {
    pub fn new(
        decoder: Box<dyn FrameDecoder>,
        index: u32,
        time_base: TimeBase,
        duration: i64,
        frequency: u32,
    ) -> Self {
        Self {
            decoder: Some(decoder),
            frame: None,
            index,
            time_base,
            duration,
            frequency,
        }
    }

    /// Total length in samples: `duration_ms * frequency / 1000`, truncated.
    pub fn sample_length(&self) -> i64 {
        self.duration * i64::from(self.frequency) / 1000
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("attached", &self.decoder.is_some())
            .field("frame", &self.frame.as_ref().map(|fr| fr.pts))
            .field("index", &self.index)
            .field("time_base", &self.time_base)
            .field("duration", &self.duration)
            .field("frequency", &self.frequency)
            .finish()
    }
}

/// Feed one packet into the stream's decoder.
pub fn process_packet(stream: &mut Stream, packet: &Packet) -> Result<(), DecodeError> {
    let decoder = stream.decoder.as_mut().ok_or(DecodeError::Detached)?;
    decoder.send_packet(packet)
}

/// Pull the next frame into `stream.frame`.
pub fn read_next_frame(stream: &mut Stream) -> Result<(), ReadError> {
    let decoder = stream.decoder.as_mut().ok_or(DecodeError::Detached)?;
    let frame = decoder.receive_frame()?;
    stream.frame = Some(frame);
    Ok(())
}

/// Position of the pending frame in milliseconds, or `None` if it cannot be resolved.
pub fn frame_position(stream: &Stream) -> Option<i64> {
    let pts = stream.frame.as_ref()?.pts?;
    stream.time_base.ticks_to_ms(pts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Scripted {
        frames: VecDeque<Result<DecodedFrame, ReadError>>,
    }

    impl FrameDecoder for Scripted {
        fn send_packet(&mut self, _packet: &Packet) -> Result<(), DecodeError> {
            Ok(())
        }

        fn receive_frame(&mut self) -> Result<DecodedFrame, ReadError> {
            self.frames.pop_front().unwrap_or(Err(ReadError::NeedMoreInput))
        }
    }

    fn frame(pts: Option<i64>) -> DecodedFrame {
        DecodedFrame {
            pts,
            channels: 2,
            samples: vec![0.0; 8],
        }
    }

    fn stream_with(frames: Vec<Result<DecodedFrame, ReadError>>) -> Stream {
        Stream::new(
            Box::new(Scripted {
                frames: frames.into(),
            }),
            0,
            TimeBase::new(1, 44_100),
            5000,
            44_100,
        )
    }

    #[test]
    fn ticks_to_ms_rounds_to_nearest() {
        let tb = TimeBase::new(1, 44_100);
        assert_eq!(tb.ticks_to_ms(44_100), Some(1000));
        assert_eq!(tb.ticks_to_ms(22), Some(0));
        assert_eq!(tb.ticks_to_ms(23), Some(1));
        assert_eq!(tb.ticks_to_ms(-23), Some(-1));
        assert_eq!(TimeBase::new(1, 1000).ticks_to_ms(1234), Some(1234));
    }

    #[test]
    fn ticks_to_ms_rejects_zero_denominator() {
        assert_eq!(TimeBase::new(1, 0).ticks_to_ms(10), None);
    }

    #[test]
    fn sample_length_truncates() {
        let mut stream = stream_with(Vec::new());
        assert_eq!(stream.sample_length(), 220_500);
        stream.duration = 1;
        stream.frequency = 3;
        assert_eq!(stream.sample_length(), 0);
    }

    #[test]
    fn read_next_frame_stores_frame() {
        let mut stream = stream_with(vec![Ok(frame(Some(44_100)))]);
        process_packet(&mut stream, &Packet::end_of_stream()).unwrap();
        read_next_frame(&mut stream).unwrap();
        assert_eq!(frame_position(&stream), Some(1000));
        assert_eq!(stream.frame.as_ref().unwrap().frames(), 4);
    }

    #[test]
    fn frame_position_unknown_without_pts() {
        let mut stream = stream_with(vec![Ok(frame(None))]);
        read_next_frame(&mut stream).unwrap();
        assert_eq!(frame_position(&stream), None);
    }

    #[test]
    fn detached_stream_fails() {
        let mut stream = stream_with(Vec::new());
        stream.decoder.take();
        assert!(matches!(
            process_packet(&mut stream, &Packet::end_of_stream()),
            Err(DecodeError::Detached)
        ));
        assert!(matches!(
            read_next_frame(&mut stream),
            Err(ReadError::Failed(DecodeError::Detached))
        ));
    }
}

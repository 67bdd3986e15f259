//! Streaming audio track.
//!
//! [`AudioTrack`] sits between the demuxer and the playback sink. Until the first frame with a
//! known timestamp is decoded it owns the [`Stream`]; then it hands the decoder to the sink,
//! reports [`Information`] through the one-shot ready callback and from there on forwards
//! packets untouched.
//!
//! Failures are reported through the error callback, at most once. After that the track is
//! inert and the owner is expected to drop it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::mixer::{
    PacketFeed, PlaybackId, PlaybackSink, PlaybackState, SoundData, Subscription, TrackState,
};
use crate::packet::Packet;
use crate::position::{PositionReceiver, PositionSignal};
use crate::stream::{self, ReadError, Stream, TimeBase};

/// Start parameters supplied by the owning pipeline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlaybackOptions {
    /// Requested start position in milliseconds.
    pub position: i64,
    /// Playback speed factor.
    pub speed: f64,
}

impl Default for PlaybackOptions {
    fn default() -> Self {
        Self {
            position: 0,
            speed: 1.0,
        }
    }
}

/// Stream facts reported once the track is ready. All values are milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Information {
    pub duration: i64,
    pub position: i64,
    /// How far the source has been received: the duration once the end marker arrived.
    pub received_till: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackError {
    #[error("track is not initialized")]
    NotInitialized,
}

pub type ReadyCallback = Box<dyn FnOnce(Information) + Send>;

/// Error callback wrapper that lets exactly one caller through.
struct ErrorNotifier {
    fired: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl ErrorNotifier {
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            (self.callback)();
        }
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Why first-frame detection gave up.
#[derive(Debug)]
enum FirstFrameFailure {
    Feed(stream::DecodeError),
    Read(ReadError),
    EndOfStreamBeforeFrame,
    NoDataAfterEnd,
    UnknownTimestamp,
}

pub struct AudioTrack {
    options: PlaybackOptions,
    stream: Stream,
    id: PlaybackId,
    sink: Arc<dyn PlaybackSink>,
    ready: Option<ReadyCallback>,
    error: Arc<ErrorNotifier>,
    position: PositionSignal,
    no_more_data: bool,
    started_position: Option<i64>,
    subscription: Option<Subscription>,
}

impl AudioTrack {
    pub fn new<R, E>(
        options: PlaybackOptions,
        stream: Stream,
        id: PlaybackId,
        sink: Arc<dyn PlaybackSink>,
        ready: R,
        error: E,
    ) -> Self
    where
        R: FnOnce(Information) + Send + 'static,
        E: Fn() + Send + Sync + 'static,
    {
        Self {
            options,
            stream,
            id,
            sink,
            ready: Some(Box::new(ready)),
            error: Arc::new(ErrorNotifier {
                fired: AtomicBool::new(false),
                callback: Box::new(error),
            }),
            position: PositionSignal::new(options.position),
            no_more_data: false,
            started_position: None,
            subscription: None,
        }
    }

    pub fn id(&self) -> PlaybackId {
        self.id
    }

    /// Safe from any thread: the index never changes after construction.
    pub fn stream_index(&self) -> u32 {
        self.stream.index
    }

    pub fn stream_time_base(&self) -> TimeBase {
        self.stream.time_base
    }

    pub fn initialized(&self) -> bool {
        self.ready.is_none()
    }

    /// Position the first decoded frame started at; `None` until initialized.
    pub fn started_position(&self) -> Option<i64> {
        self.started_position
    }

    /// Push the next demuxed packet. The empty packet marks end of stream.
    pub fn process(&mut self, packet: Packet) {
        self.no_more_data = packet.is_empty();
        if self.error.has_fired() {
            tracing::warn!(id = %self.id, "packet dropped by failed track");
            return;
        }
        if self.initialized() {
            self.sink.enqueue(PacketFeed {
                packet,
                id: self.id,
            });
            return;
        }
        if let Err(failure) = self.try_read_first_frame(packet) {
            tracing::warn!(id = %self.id, ?failure, "audio track failed to start");
            self.error.fire();
        }
    }

    /// `Ok(())` covers both success and "waiting for more input".
    fn try_read_first_frame(&mut self, packet: Packet) -> Result<(), FirstFrameFailure> {
        stream::process_packet(&mut self.stream, &packet).map_err(FirstFrameFailure::Feed)?;
        match stream::read_next_frame(&mut self.stream) {
            Ok(()) => {}
            Err(ReadError::EndOfStream) => return Err(FirstFrameFailure::EndOfStreamBeforeFrame),
            Err(ReadError::NeedMoreInput) if self.no_more_data => {
                return Err(FirstFrameFailure::NoDataAfterEnd);
            }
            Err(ReadError::NeedMoreInput) => return Ok(()),
            Err(e @ ReadError::Failed(_)) => return Err(FirstFrameFailure::Read(e)),
        }
        let started =
            stream::frame_position(&self.stream).ok_or(FirstFrameFailure::UnknownTimestamp)?;
        self.started_position = Some(started);
        self.mixer_init(started)?;
        self.call_ready(started);
        Ok(())
    }

    fn mixer_init(&mut self, started: i64) -> Result<(), FirstFrameFailure> {
        let decoder = self
            .stream
            .decoder
            .take()
            .ok_or(FirstFrameFailure::Feed(stream::DecodeError::Detached))?;
        let data = SoundData {
            decoder,
            frame: self.stream.frame.take(),
            frequency: self.stream.frequency,
            length: self.stream.sample_length(),
            speed: self.options.speed,
        };
        tracing::debug!(id = %self.id, started_ms = started, ?data, "handing stream to sink");
        self.sink.begin_playback(self.id, data, started);
        Ok(())
    }

    fn call_ready(&mut self, started: i64) {
        let Some(ready) = self.ready.take() else {
            return;
        };
        let duration = self.stream.duration;
        ready(Information {
            duration,
            position: started,
            received_till: if self.no_more_data { duration } else { started },
        });
    }

    /// Resume output in the sink.
    ///
    /// Starting from a paused, not yet initialized track is not supported.
    pub fn start(&self, start_time: i64) -> Result<(), TrackError> {
        if !self.initialized() {
            return Err(TrackError::NotInitialized);
        }
        tracing::debug!(id = %self.id, start_time, "resume");
        self.sink.resume(self.id, true);
        Ok(())
    }

    /// Millisecond playback position reported by the sink.
    ///
    /// The first call subscribes to sink updates; the subscription lives as long as the track.
    /// The sink's current state is applied right after subscribing, so a state published
    /// before that (a failed start, an early end) is not lost.
    pub fn play_position(&mut self) -> Result<PositionReceiver, TrackError> {
        if !self.initialized() {
            return Err(TrackError::NotInitialized);
        }
        if self.subscription.is_none() {
            let id = self.id;
            let position = self.position.clone();
            let error = self.error.clone();
            self.subscription = Some(
                self.sink
                    .updates()
                    .subscribe(move |state| on_sink_update(id, &position, &error, state)),
            );
            let current = self.sink.current_state(self.id.kind);
            on_sink_update(self.id, &self.position, &self.error, &current);
        }
        Ok(self.position.subscribe())
    }
}

fn on_sink_update(
    id: PlaybackId,
    position: &PositionSignal,
    error: &ErrorNotifier,
    state: &TrackState,
) {
    if state.id != id {
        // Another playback reported or took over the slot: keep the last value.
        tracing::trace!(id = %id, other = %state.id, "ignoring foreign sink update");
        return;
    }
    match state.state {
        PlaybackState::Stopped | PlaybackState::StoppedAtEnd | PlaybackState::PausedAtEnd => {
            position.close();
        }
        PlaybackState::StoppedAtError | PlaybackState::StoppedAtStart => {
            tracing::warn!(id = %id, state = ?state.state, "sink reported failure");
            error.fire();
        }
        PlaybackState::Starting
        | PlaybackState::Playing
        | PlaybackState::Stopping
        | PlaybackState::Pausing
        | PlaybackState::Resuming => match state.position_ms() {
            Some(ms) => position.set(ms),
            None => tracing::warn!(id = %id, "sink update without frequency"),
        },
        PlaybackState::Paused => {}
    }
}

impl Drop for AudioTrack {
    fn drop(&mut self) {
        self.subscription = None;
        self.sink.stop(self.id);
    }
}

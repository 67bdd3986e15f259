//! Playback sink contract.
//!
//! A track hands decoded audio to a [`PlaybackSink`] and listens to its [`NotificationBus`]
//! for [`TrackState`] snapshots. The sink is always injected; [`local::LocalMixer`] is the
//! cpal-backed implementation.

pub mod local;
pub mod updates;

use std::fmt;
use std::num::NonZeroU64;

use crate::packet::Packet;
use crate::stream::{DecodedFrame, FrameDecoder};

pub use updates::{NotificationBus, Subscription};

/// Output slot a playback belongs to. The sink plays at most one track per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Song,
    Voice,
    Video,
}

/// Identifier of one playback in the sink. The play id is never zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PlaybackId {
    pub kind: TrackKind,
    pub play_id: NonZeroU64,
}

impl PlaybackId {
    pub fn new(kind: TrackKind, play_id: NonZeroU64) -> Self {
        Self { kind, play_id }
    }
}

impl fmt::Display for PlaybackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.play_id)
    }
}

/// Discrete sink states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackState {
    Starting,
    Playing,
    Stopping,
    Pausing,
    Resuming,
    Paused,
    Stopped,
    StoppedAtEnd,
    PausedAtEnd,
    StoppedAtError,
    StoppedAtStart,
}

impl PlaybackState {
    /// Terminal states after which the sink no longer advances the playback.
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            PlaybackState::Stopped
                | PlaybackState::StoppedAtEnd
                | PlaybackState::StoppedAtError
                | PlaybackState::StoppedAtStart
        )
    }
}

/// Snapshot of one playback as reported by the sink.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrackState {
    pub id: PlaybackId,
    pub state: PlaybackState,
    /// Position in samples.
    pub position: i64,
    /// Sample rate the position is expressed in.
    pub frequency: u32,
}

impl TrackState {
    /// Position in milliseconds, or `None` when the frequency is unknown.
    pub fn position_ms(&self) -> Option<i64> {
        if self.frequency == 0 {
            return None;
        }
        Some(self.position * 1000 / i64::from(self.frequency))
    }
}

/// Decoded audio handed to the sink when a track starts.
///
/// Carries the codec decoder and the first decoded frame; the track keeps neither.
pub struct SoundData {
    pub decoder: Box<dyn FrameDecoder>,
    pub frame: Option<DecodedFrame>,
    pub frequency: u32,
    /// Total length in samples.
    pub length: i64,
    pub speed: f64,
}

impl fmt::Debug for SoundData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoundData")
            .field("frame", &self.frame.as_ref().map(|fr| fr.pts))
            .field("frequency", &self.frequency)
            .field("length", &self.length)
            .field("speed", &self.speed)
            .finish()
    }
}

/// A packet addressed to one playback.
#[derive(Debug)]
pub struct PacketFeed {
    pub packet: Packet,
    pub id: PlaybackId,
}

/// Audio output collaborator of a track.
///
/// Calls never block on playback; implementations queue work for their own thread and
/// report progress through [`PlaybackSink::updates`].
pub trait PlaybackSink: Send + Sync {
    /// Take over decoding and start a (paused) playback at `started_position` ms.
    fn begin_playback(&self, id: PlaybackId, data: SoundData, started_position: i64);

    /// Queue a packet for a started playback; the empty packet marks end of stream.
    fn enqueue(&self, feed: PacketFeed);

    fn resume(&self, id: PlaybackId, fast: bool);

    /// Stop and release a playback. Unknown ids are ignored.
    fn stop(&self, id: PlaybackId);

    /// Latest state of the playback occupying `kind`'s slot.
    fn current_state(&self, kind: TrackKind) -> TrackState;

    fn updates(&self) -> &NotificationBus;
}

pub mod config;
pub mod decode;
pub mod device;
pub mod mixer;
pub mod packet;
pub mod playback;
pub mod position;
pub mod queue;
pub mod resample;
pub mod stream;
pub mod track;

pub use mixer::{PlaybackId, PlaybackSink, PlaybackState, TrackKind, TrackState};
pub use packet::Packet;
pub use position::{PositionReceiver, PositionSignal};
pub use stream::{Stream, TimeBase};
pub use track::{AudioTrack, Information, PlaybackOptions, TrackError};

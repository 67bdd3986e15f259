//! cpal-backed playback sink.
//!
//! [`LocalMixer`] owns a worker thread that decodes fed packets, converts them to the output
//! rate and keeps one cpal output stream per [`TrackKind`] slot topped up. Callers only send
//! commands; every state change comes back through the [`NotificationBus`].

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use cpal::traits::{DeviceTrait, StreamTrait};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{
    NotificationBus, PacketFeed, PlaybackId, PlaybackSink, PlaybackState, SoundData, TrackKind,
    TrackState,
};
use crate::config::MixerConfig;
use crate::device;
use crate::packet::Packet;
use crate::playback::{self, OutputOptions, mapped_sample};
use crate::queue::{SharedAudio, calc_max_buffered_samples};
use crate::resample::{SpeedResampler, effective_rate, needs_resampling};
use crate::stream::{DecodedFrame, FrameDecoder, ReadError};

/// Commands accepted by the mixer worker.
enum MixerCommand {
    Play {
        id: PlaybackId,
        data: SoundData,
        started_position: i64,
    },
    Feed(PacketFeed),
    Resume {
        id: PlaybackId,
        fast: bool,
    },
    Stop(PlaybackId),
    Quit,
}

/// Last published state per slot plus the bus it was published on.
#[derive(Clone, Default)]
struct Publisher {
    bus: NotificationBus,
    states: Arc<Mutex<HashMap<TrackKind, TrackState>>>,
}

impl Publisher {
    fn publish(&self, state: TrackState) {
        tracing::debug!(id = %state.id, state = ?state.state, position = state.position, "playback state");
        if let Ok(mut states) = self.states.lock() {
            states.insert(state.id.kind, state);
        }
        self.bus.publish(&state);
    }

    /// Same as [`Publisher::publish`] but without the log line, for periodic reports.
    /// A report never overrides a stopped state of the same playback.
    fn report(&self, state: TrackState) {
        if let Ok(mut states) = self.states.lock() {
            if states
                .get(&state.id.kind)
                .is_some_and(|last| last.id == state.id && last.state.is_stopped())
            {
                return;
            }
            states.insert(state.id.kind, state);
        }
        self.bus.publish(&state);
    }

    fn current(&self, kind: TrackKind) -> TrackState {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(&kind).copied())
            .unwrap_or(TrackState {
                id: PlaybackId::new(kind, NonZeroU64::MIN),
                state: PlaybackState::Stopped,
                position: 0,
                frequency: 0,
            })
    }
}

/// Playback sink that renders to a local output device.
pub struct LocalMixer {
    cmd_tx: Sender<MixerCommand>,
    publisher: Publisher,
    join: Option<JoinHandle<()>>,
}

impl LocalMixer {
    /// Start the worker thread. Devices are opened lazily per playback.
    pub fn spawn(config: MixerConfig) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let publisher = Publisher::default();
        let worker_publisher = publisher.clone();
        let join = std::thread::Builder::new()
            .name("audio-mixer".into())
            .spawn(move || mixer_thread_main(config, cmd_rx, worker_publisher))
            .context("spawn mixer thread")?;
        Ok(Self {
            cmd_tx,
            publisher,
            join: Some(join),
        })
    }

    fn send(&self, cmd: MixerCommand) {
        if self.cmd_tx.send(cmd).is_err() {
            tracing::debug!("mixer worker is gone; command dropped");
        }
    }
}

impl PlaybackSink for LocalMixer {
    fn begin_playback(&self, id: PlaybackId, data: SoundData, started_position: i64) {
        self.send(MixerCommand::Play {
            id,
            data,
            started_position,
        });
    }

    fn enqueue(&self, feed: PacketFeed) {
        self.send(MixerCommand::Feed(feed));
    }

    fn resume(&self, id: PlaybackId, fast: bool) {
        self.send(MixerCommand::Resume { id, fast });
    }

    fn stop(&self, id: PlaybackId) {
        self.send(MixerCommand::Stop(id));
    }

    fn current_state(&self, kind: TrackKind) -> TrackState {
        self.publisher.current(kind)
    }

    fn updates(&self) -> &NotificationBus {
        &self.publisher.bus
    }
}

impl Drop for LocalMixer {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(MixerCommand::Quit);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Main command loop of the mixer worker.
fn mixer_thread_main(config: MixerConfig, cmd_rx: Receiver<MixerCommand>, publisher: Publisher) {
    let interval = config.report_interval();
    let mut slots: HashMap<TrackKind, Slot> = HashMap::new();
    let mut last_report = Instant::now();

    loop {
        match cmd_rx.recv_timeout(interval) {
            Ok(MixerCommand::Quit) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(MixerCommand::Play {
                id,
                data,
                started_position,
            }) => {
                if let Some(old) = slots.remove(&id.kind) {
                    publisher.publish(old.snapshot(PlaybackState::Stopped));
                }
                let started_samples = started_position * i64::from(data.frequency) / 1000;
                let frequency = data.frequency;
                match Slot::open(&config, id, data, started_samples) {
                    Ok(slot) => {
                        publisher.publish(slot.snapshot(PlaybackState::Paused));
                        slots.insert(id.kind, slot);
                    }
                    Err(e) => {
                        tracing::warn!(id = %id, "playback start failed: {e:#}");
                        publisher.publish(TrackState {
                            id,
                            state: PlaybackState::StoppedAtStart,
                            position: started_samples,
                            frequency,
                        });
                    }
                }
            }
            Ok(MixerCommand::Feed(PacketFeed { packet, id })) => {
                let Some(slot) = slot_for(&mut slots, id) else {
                    tracing::trace!(id = %id, "packet for unknown playback dropped");
                    continue;
                };
                if let Err(e) = slot.feeder.feed(packet) {
                    tracing::warn!(id = %id, "decode failed: {e:#}");
                    if let Some(slot) = slots.remove(&id.kind) {
                        publisher.publish(slot.snapshot(PlaybackState::StoppedAtError));
                    }
                }
            }
            Ok(MixerCommand::Resume { id, fast }) => {
                let Some(slot) = slot_for(&mut slots, id) else {
                    tracing::debug!(id = %id, "resume for unknown playback ignored");
                    continue;
                };
                if slot.state != PlaybackState::Playing {
                    tracing::debug!(id = %id, fast, "resuming");
                    publisher.publish(slot.snapshot(PlaybackState::Resuming));
                    slot.paused.store(false, Ordering::Relaxed);
                    slot.state = PlaybackState::Playing;
                    publisher.publish(slot.snapshot(PlaybackState::Playing));
                }
            }
            Ok(MixerCommand::Stop(id)) => {
                if slot_for(&mut slots, id).is_some() {
                    if let Some(slot) = slots.remove(&id.kind) {
                        slot.paused.store(true, Ordering::Relaxed);
                        publisher.publish(slot.snapshot(PlaybackState::Stopped));
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        for slot in slots.values_mut() {
            slot.feeder.pump();
        }

        let finished: Vec<TrackKind> = slots
            .iter()
            .filter(|(_, slot)| slot.state == PlaybackState::Playing && slot.feeder.is_drained())
            .map(|(kind, _)| *kind)
            .collect();
        for kind in finished {
            if let Some(slot) = slots.remove(&kind) {
                publisher.publish(slot.snapshot(PlaybackState::StoppedAtEnd));
            }
        }

        if last_report.elapsed() >= interval {
            last_report = Instant::now();
            for slot in slots.values() {
                if slot.state == PlaybackState::Playing {
                    publisher.report(slot.snapshot(PlaybackState::Playing));
                }
            }
        }
    }

    for (_, slot) in slots.drain() {
        slot.paused.store(true, Ordering::Relaxed);
    }
    tracing::debug!("mixer worker exiting");
}

fn slot_for(slots: &mut HashMap<TrackKind, Slot>, id: PlaybackId) -> Option<&mut Slot> {
    slots.get_mut(&id.kind).filter(|slot| slot.id == id)
}

/// One playback occupying a [`TrackKind`] slot.
struct Slot {
    id: PlaybackId,
    state: PlaybackState,
    feeder: Feeder,
    paused: Arc<AtomicBool>,
    played_frames: Arc<AtomicU64>,
    frequency: u32,
    speed: f64,
    output_rate: u32,
    started_samples: i64,
    _stream: cpal::Stream,
}

impl Slot {
    fn open(config: &MixerConfig, id: PlaybackId, data: SoundData, started_samples: i64) -> Result<Self> {
        let SoundData {
            decoder,
            frame,
            frequency,
            length,
            speed,
        } = data;
        let frame = frame.ok_or_else(|| anyhow!("no decoded frame to start from"))?;
        if frequency == 0 {
            return Err(anyhow!("unknown sample rate"));
        }
        let channels = frame.channels.max(1);

        let host = cpal::default_host();
        let device = device::pick_device(&host, config.device.as_deref())?;
        let target_rate = effective_rate(frequency, speed).round() as u32;
        let output_config = device::pick_output_config(&device, Some(target_rate))?;
        let mut stream_config: cpal::StreamConfig = output_config.clone().into();
        if let Some(buf) = device::pick_buffer_size(&output_config) {
            stream_config.buffer_size = buf;
        }
        let output_rate = stream_config.sample_rate;

        let queue = Arc::new(SharedAudio::new(
            channels,
            calc_max_buffered_samples(output_rate, channels, config.buffer_seconds),
        ));
        let paused = Arc::new(AtomicBool::new(true));
        let played_frames = Arc::new(AtomicU64::new(0));
        let stream = playback::build_output_stream(
            &device,
            &stream_config,
            output_config.sample_format(),
            &queue,
            OutputOptions {
                refill_max_frames: config.refill_max_frames,
                paused: paused.clone(),
                played_frames: played_frames.clone(),
            },
        )
        .context("build output stream")?;
        stream.play().context("start output stream")?;

        let resampler = if needs_resampling(frequency, speed, output_rate) {
            Some(SpeedResampler::new(
                effective_rate(frequency, speed),
                output_rate,
                channels,
                config.chunk_frames,
            )?)
        } else {
            None
        };

        tracing::info!(
            id = %id,
            device = %device.description().map(|d| d.to_string()).unwrap_or_default(),
            source_rate = frequency,
            output_rate,
            channels,
            speed,
            length,
            resampling = resampler.is_some(),
            "playback opened"
        );

        let mut feeder = Feeder::new(decoder, queue, channels, resampler);
        feeder.accept(frame)?;
        feeder.pump();

        Ok(Self {
            id,
            state: PlaybackState::Paused,
            feeder,
            paused,
            played_frames,
            frequency,
            speed,
            output_rate,
            started_samples,
            _stream: stream,
        })
    }

    fn position(&self) -> i64 {
        playback_position(
            self.started_samples,
            self.played_frames.load(Ordering::Relaxed),
            self.frequency,
            self.speed,
            self.output_rate,
        )
    }

    fn snapshot(&self, state: PlaybackState) -> TrackState {
        TrackState {
            id: self.id,
            state,
            position: self.position(),
            frequency: self.frequency,
        }
    }
}

/// Position in source samples after `played_frames` output frames.
fn playback_position(
    started_samples: i64,
    played_frames: u64,
    frequency: u32,
    speed: f64,
    output_rate: u32,
) -> i64 {
    if output_rate == 0 {
        return started_samples;
    }
    let advanced = played_frames as f64 * effective_rate(frequency, speed) / f64::from(output_rate);
    started_samples + advanced.round() as i64
}

/// Decoder side of a slot: packets in, output-rate samples into the shared queue.
struct Feeder {
    decoder: Box<dyn FrameDecoder>,
    queue: Arc<SharedAudio>,
    channels: usize,
    resampler: Option<SpeedResampler>,
    pending: Vec<f32>,
    ended: bool,
}

impl Feeder {
    fn new(
        decoder: Box<dyn FrameDecoder>,
        queue: Arc<SharedAudio>,
        channels: usize,
        resampler: Option<SpeedResampler>,
    ) -> Self {
        Self {
            decoder,
            queue,
            channels,
            resampler,
            pending: Vec::new(),
            ended: false,
        }
    }

    fn feed(&mut self, packet: Packet) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.ended = packet.is_empty();
        self.decoder.send_packet(&packet)?;
        loop {
            match self.decoder.receive_frame() {
                Ok(frame) => self.accept(frame)?,
                Err(ReadError::NeedMoreInput) | Err(ReadError::EndOfStream) => break,
                Err(ReadError::Failed(e)) => return Err(e.into()),
            }
        }
        if self.ended {
            if let Some(resampler) = self.resampler.as_mut() {
                resampler.flush(&mut self.pending)?;
            }
        }
        Ok(())
    }

    fn accept(&mut self, frame: DecodedFrame) -> Result<()> {
        let samples = conform_channels(frame.samples, frame.channels, self.channels);
        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&samples, &mut self.pending),
            None => {
                self.pending.extend_from_slice(&samples);
                Ok(())
            }
        }
    }

    /// Move as much pending audio into the queue as fits; close it once everything is in.
    fn pump(&mut self) {
        if !self.pending.is_empty() {
            let taken = self.queue.try_push_interleaved(&self.pending);
            self.pending.drain(..taken);
        }
        if self.ended && self.pending.is_empty() && !self.queue.is_done() {
            self.queue.close();
        }
    }

    fn is_drained(&self) -> bool {
        self.queue.is_drained()
    }
}

/// Remap interleaved `samples` from `from` to `to` channels.
fn conform_channels(samples: Vec<f32>, from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 {
        return samples;
    }
    samples
        .chunks_exact(from)
        .flat_map(|frame| (0..to).map(move |ch| mapped_sample(frame, to, ch)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketFields;
    use crate::stream::DecodeError;
    use std::collections::VecDeque;

    fn id(kind: TrackKind, n: u64) -> PlaybackId {
        PlaybackId::new(kind, NonZeroU64::new(n).unwrap())
    }

    /// Emits one frame of `frame_len` mono samples per data packet.
    struct ToneDecoder {
        frame_len: usize,
        fail_after: Option<usize>,
        fed: usize,
        ready: VecDeque<DecodedFrame>,
        draining: bool,
    }

    impl ToneDecoder {
        fn new(frame_len: usize) -> Self {
            Self {
                frame_len,
                fail_after: None,
                fed: 0,
                ready: VecDeque::new(),
                draining: false,
            }
        }
    }

    impl FrameDecoder for ToneDecoder {
        fn send_packet(&mut self, packet: &Packet) -> Result<(), DecodeError> {
            if packet.is_empty() {
                self.draining = true;
                return Ok(());
            }
            if self.fail_after == Some(self.fed) {
                return Err(DecodeError::Codec("corrupt".into()));
            }
            self.fed += 1;
            self.ready.push_back(DecodedFrame {
                pts: packet.fields().and_then(|f| f.pts),
                channels: 1,
                samples: vec![0.5; self.frame_len],
            });
            Ok(())
        }

        fn receive_frame(&mut self) -> Result<DecodedFrame, ReadError> {
            match self.ready.pop_front() {
                Some(frame) => Ok(frame),
                None if self.draining => Err(ReadError::EndOfStream),
                None => Err(ReadError::NeedMoreInput),
            }
        }
    }

    fn packet(pts: i64) -> Packet {
        Packet::new(PacketFields {
            stream_index: 0,
            pts: Some(pts),
            duration: 4,
            data: vec![1u8; 4].into_boxed_slice(),
        })
    }

    #[test]
    fn position_advances_with_played_frames() {
        assert_eq!(playback_position(0, 48_000, 48_000, 1.0, 48_000), 48_000);
        assert_eq!(playback_position(0, 48_000, 44_100, 1.0, 48_000), 44_100);
        assert_eq!(playback_position(1_000, 24_000, 48_000, 2.0, 48_000), 49_000);
        assert_eq!(playback_position(500, 10, 48_000, 1.0, 0), 500);
    }

    #[test]
    fn conform_channels_duplicates_mono() {
        assert_eq!(conform_channels(vec![0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
        assert_eq!(conform_channels(vec![0.25, 0.75], 2, 1), vec![0.5]);
        assert_eq!(conform_channels(vec![0.3], 1, 1), vec![0.3]);
    }

    #[test]
    fn feeder_moves_frames_into_queue_and_closes_at_end() {
        let queue = Arc::new(SharedAudio::new(2, 64));
        let mut feeder = Feeder::new(Box::new(ToneDecoder::new(4)), queue.clone(), 2, None);

        feeder.feed(packet(0)).unwrap();
        feeder.feed(packet(4)).unwrap();
        feeder.pump();
        assert_eq!(queue.len_frames(), 8);
        assert!(!queue.is_done());

        feeder.feed(Packet::end_of_stream()).unwrap();
        feeder.pump();
        assert!(queue.is_done());
        assert!(!feeder.is_drained());

        while queue.pop_up_to(16).is_some() {}
        assert!(feeder.is_drained());
    }

    #[test]
    fn feeder_keeps_what_does_not_fit() {
        let queue = Arc::new(SharedAudio::new(1, 6));
        let mut feeder = Feeder::new(Box::new(ToneDecoder::new(4)), queue.clone(), 1, None);

        feeder.feed(packet(0)).unwrap();
        feeder.feed(packet(4)).unwrap();
        feeder.feed(Packet::end_of_stream()).unwrap();
        feeder.pump();
        assert_eq!(queue.len_frames(), 6);
        assert!(!queue.is_done());

        queue.pop_up_to(6);
        feeder.pump();
        assert_eq!(queue.len_frames(), 2);
        assert!(queue.is_done());
    }

    #[test]
    fn feeder_reports_decoder_failure() {
        let mut decoder = ToneDecoder::new(4);
        decoder.fail_after = Some(1);
        let queue = Arc::new(SharedAudio::new(1, 64));
        let mut feeder = Feeder::new(Box::new(decoder), queue, 1, None);

        assert!(feeder.feed(packet(0)).is_ok());
        assert!(feeder.feed(packet(4)).is_err());
    }

    #[test]
    fn feeder_ignores_packets_after_end() {
        let queue = Arc::new(SharedAudio::new(1, 64));
        let mut feeder = Feeder::new(Box::new(ToneDecoder::new(4)), queue.clone(), 1, None);
        feeder.feed(Packet::end_of_stream()).unwrap();
        feeder.feed(packet(0)).unwrap();
        feeder.pump();
        assert_eq!(queue.len_frames(), 0);
        assert!(queue.is_drained());
    }

    #[test]
    fn feeder_resamples_through_to_queue() {
        let queue = Arc::new(SharedAudio::new(1, 1 << 16));
        let resampler = SpeedResampler::new(24_000.0, 48_000, 1, 256).unwrap();
        let mut feeder = Feeder::new(Box::new(ToneDecoder::new(256)), queue.clone(), 1, Some(resampler));

        for n in 0..4 {
            feeder.feed(packet(n * 256)).unwrap();
        }
        feeder.feed(Packet::end_of_stream()).unwrap();
        feeder.pump();
        assert!(queue.is_done());
        assert!(queue.len_frames() > 1024);
    }

    #[test]
    fn publisher_tracks_latest_state_per_kind() {
        let publisher = Publisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = publisher
            .bus
            .subscribe(move |s: &TrackState| sink.lock().unwrap().push(s.state));

        let placeholder = publisher.current(TrackKind::Video);
        assert_eq!(placeholder.state, PlaybackState::Stopped);
        assert_eq!(placeholder.frequency, 0);

        let state = TrackState {
            id: id(TrackKind::Video, 3),
            state: PlaybackState::Paused,
            position: 10,
            frequency: 8_000,
        };
        publisher.publish(state);
        publisher.report(TrackState {
            state: PlaybackState::Playing,
            ..state
        });

        assert_eq!(publisher.current(TrackKind::Video).state, PlaybackState::Playing);
        assert_eq!(publisher.current(TrackKind::Song).state, PlaybackState::Stopped);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PlaybackState::Paused, PlaybackState::Playing]
        );
    }

    #[test]
    fn reports_after_stop_are_dropped() {
        let publisher = Publisher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = publisher
            .bus
            .subscribe(move |s: &TrackState| sink.lock().unwrap().push(s.state));

        let stopped = TrackState {
            id: id(TrackKind::Song, 4),
            state: PlaybackState::StoppedAtEnd,
            position: 400,
            frequency: 8_000,
        };
        publisher.publish(stopped);
        publisher.report(TrackState {
            state: PlaybackState::Playing,
            ..stopped
        });
        assert_eq!(publisher.current(TrackKind::Song), stopped);

        let next = TrackState {
            id: id(TrackKind::Song, 5),
            state: PlaybackState::Playing,
            position: 0,
            frequency: 8_000,
        };
        publisher.report(next);
        assert_eq!(publisher.current(TrackKind::Song), next);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![PlaybackState::StoppedAtEnd, PlaybackState::Playing]
        );
    }

    #[test]
    fn mixer_ignores_unknown_ids_and_shuts_down() {
        let mixer = LocalMixer::spawn(MixerConfig::default()).unwrap();
        let stranger = id(TrackKind::Voice, 9);
        mixer.resume(stranger, true);
        mixer.enqueue(PacketFeed {
            packet: packet(0),
            id: stranger,
        });
        mixer.stop(stranger);

        let state = mixer.current_state(TrackKind::Voice);
        assert_eq!(state.state, PlaybackState::Stopped);
        assert_eq!(mixer.updates().subscriber_count(), 0);
        drop(mixer);
    }
}

//! track-player: plays a local file through a streaming [`AudioTrack`].
//!
//! The file is demuxed with symphonia and fed packet by packet into an `AudioTrack` wired to a
//! [`LocalMixer`]. Playback starts when the track reports ready; feeding is paced so it never
//! runs more than `lead_ms` ahead of the reported position.

mod cli;
mod config;
mod demux;

use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use audio_track::mixer::local::LocalMixer;
use audio_track::{
    AudioTrack, Information, Packet, PlaybackId, PlaybackOptions, PlaybackSink, PositionReceiver,
    TrackKind,
};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing_subscriber::EnvFilter;

use crate::config::PlayerFileConfig;

const POLL: Duration = Duration::from_millis(100);

/// Callback events forwarded from the track to the feeding loop.
enum TrackEvent {
    Ready(Information),
    Failed,
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,track_player=info,audio_track=info")
        }))
        .init();

    let _ = ctrlc::set_handler(|| std::process::exit(130));

    if args.list_devices {
        let host = cpal::default_host();
        for (i, name) in audio_track::device::list_devices(&host)?.iter().enumerate() {
            println!("#{i}: {name}");
        }
        return Ok(());
    }

    let cfg = PlayerFileConfig::resolve(&args)?;
    match &args.cmd {
        Some(cli::Command::Play { path }) => {
            let options = PlaybackOptions {
                position: args.position.max(0),
                speed: args.speed,
            };
            play(path, &cfg, options)
        }
        None => Err(anyhow!("nothing to do: pass `play <PATH>` or --list-devices")),
    }
}

fn play(path: &Path, cfg: &PlayerFileConfig, options: PlaybackOptions) -> Result<()> {
    let (mut demuxer, stream) = demux::open(path, options.position)?;
    let time_base = stream.time_base;
    let mixer: Arc<dyn PlaybackSink> = Arc::new(LocalMixer::spawn(cfg.mixer.clone())?);

    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let error_tx = event_tx.clone();
    let id = PlaybackId::new(TrackKind::Video, NonZeroU64::MIN);
    let mut track = AudioTrack::new(
        options,
        stream,
        id,
        mixer.clone(),
        move |info| {
            let _ = event_tx.send(TrackEvent::Ready(info));
        },
        move || {
            let _ = error_tx.send(TrackEvent::Failed);
        },
    );

    let mut positions: Option<PositionReceiver> = None;
    loop {
        handle_events(&mut track, &event_rx, &mut positions)?;

        let Some(packet) = demuxer.next_packet()? else {
            tracing::debug!("end of input");
            track.process(Packet::end_of_stream());
            break;
        };
        let packet_ms = packet
            .fields()
            .and_then(|f| f.pts)
            .and_then(|pts| time_base.ticks_to_ms(pts));
        if let Some(packet_ms) = packet_ms {
            wait_for_lead(&mut track, &event_rx, &mut positions, packet_ms, cfg.player.lead_ms)?;
        }
        track.process(packet);
    }

    wait_until_finished(&mut track, &event_rx, &mut positions)?;
    tracing::info!("playback finished");
    Ok(())
}

/// React to callbacks fired since the last call: start on ready, fail on error.
fn handle_events(
    track: &mut AudioTrack,
    events: &Receiver<TrackEvent>,
    positions: &mut Option<PositionReceiver>,
) -> Result<()> {
    while let Ok(event) = events.try_recv() {
        match event {
            TrackEvent::Ready(info) => {
                tracing::info!(
                    duration_ms = info.duration,
                    position_ms = info.position,
                    received_till_ms = info.received_till,
                    "track ready"
                );
                track.start(info.position)?;
                *positions = Some(track.play_position()?);
            }
            TrackEvent::Failed => return Err(anyhow!("audio track failed")),
        }
    }
    Ok(())
}

/// Block while the packet at `packet_ms` would run too far ahead of playback.
fn wait_for_lead(
    track: &mut AudioTrack,
    events: &Receiver<TrackEvent>,
    positions: &mut Option<PositionReceiver>,
    packet_ms: i64,
    lead_ms: u64,
) -> Result<()> {
    loop {
        let Some(rx) = positions.as_mut() else {
            return Ok(());
        };
        if !demux::is_too_far_ahead(packet_ms, rx.latest(), lead_ms) || rx.is_closed() {
            return Ok(());
        }
        if let Ok(ms) = rx.recv_timeout(POLL) {
            tracing::debug!(position_ms = ms, "position");
        }
        handle_events(track, events, positions)?;
    }
}

/// Wait for the position signal to close or for a failure.
fn wait_until_finished(
    track: &mut AudioTrack,
    events: &Receiver<TrackEvent>,
    positions: &mut Option<PositionReceiver>,
) -> Result<()> {
    let mut last_logged_sec = None;
    loop {
        handle_events(track, events, positions)?;
        let Some(rx) = positions.as_mut() else {
            // Ready or error is guaranteed once the end marker went in.
            std::thread::sleep(POLL);
            continue;
        };
        match rx.recv_timeout(POLL) {
            Ok(ms) => {
                let sec = ms / 1000;
                if last_logged_sec != Some(sec) {
                    last_logged_sec = Some(sec);
                    tracing::info!(position_ms = ms, "position");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

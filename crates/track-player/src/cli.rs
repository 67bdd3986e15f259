use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "track-player", version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// TOML file with `[mixer]` and `[player]` tables
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// Playback speed factor
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Start position in milliseconds
    #[arg(long, default_value_t = 0)]
    pub position: i64,

    /// Output queue target in seconds
    #[arg(long)]
    pub buffer_seconds: Option<f32>,

    /// How far (ms) feeding may run ahead of the playback position
    #[arg(long)]
    pub lead_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Play a local file through an audio track
    Play {
        /// Path to an audio file
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_play_with_overrides() {
        let args = Args::try_parse_from([
            "track-player",
            "--speed",
            "1.5",
            "--position",
            "2500",
            "--device",
            "usb",
            "play",
            "song.flac",
        ])
        .unwrap();
        assert_eq!(args.speed, 1.5);
        assert_eq!(args.position, 2500);
        assert_eq!(args.device.as_deref(), Some("usb"));
        assert!(matches!(args.cmd, Some(Command::Play { ref path }) if path == &PathBuf::from("song.flac")));
    }

    #[test]
    fn list_devices_needs_no_subcommand() {
        let args = Args::try_parse_from(["track-player", "--list-devices"]).unwrap();
        assert!(args.list_devices);
        assert!(args.cmd.is_none());
        assert_eq!(args.speed, 1.0);
    }
}

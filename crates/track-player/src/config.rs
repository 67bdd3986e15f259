//! Player configuration: an optional TOML file overridden by command-line flags.

use std::path::Path;

use anyhow::{Context, Result};
use audio_track::config::MixerConfig;
use serde::Deserialize;

use crate::cli::Args;

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlayerFileConfig {
    pub mixer: MixerConfig,
    pub player: FeedConfig,
}

/// Feeding behaviour of the player.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeedConfig {
    /// Max distance (ms) between the last fed packet and the playback position.
    pub lead_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self { lead_ms: 1500 }
    }
}

impl PlayerFileConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        toml::from_str::<PlayerFileConfig>(&raw).with_context(|| format!("parse config {:?}", path))
    }

    /// File values (or defaults) with command-line overrides applied.
    pub fn resolve(args: &Args) -> Result<Self> {
        let mut cfg = match args.config.as_deref() {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        cfg.apply_overrides(args);
        Ok(cfg)
    }

    fn apply_overrides(&mut self, args: &Args) {
        if let Some(device) = args.device.as_ref() {
            self.mixer.device = Some(device.clone());
        }
        if let Some(secs) = args.buffer_seconds {
            self.mixer.buffer_seconds = secs;
        }
        if let Some(lead) = args.lead_ms {
            self.player.lead_ms = lead;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg: PlayerFileConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, PlayerFileConfig::default());
        assert_eq!(cfg.player.lead_ms, 1500);
        assert_eq!(cfg.mixer.chunk_frames, 1024);
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let cfg: PlayerFileConfig = toml::from_str(
            r#"
            [mixer]
            device = "USB"
            report_interval_ms = 20

            [player]
            lead_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(cfg.mixer.device.as_deref(), Some("USB"));
        assert_eq!(cfg.mixer.report_interval_ms, 20);
        assert_eq!(cfg.mixer.buffer_seconds, 2.0);
        assert_eq!(cfg.player.lead_ms, 500);
    }

    #[test]
    fn flags_override_file_values() {
        let mut cfg: PlayerFileConfig = toml::from_str(
            r#"
            [mixer]
            device = "USB"
            buffer_seconds = 4.0
            "#,
        )
        .unwrap();
        let args = Args::try_parse_from([
            "track-player",
            "--device",
            "Speakers",
            "--lead-ms",
            "250",
            "play",
            "a.flac",
        ])
        .unwrap();
        cfg.apply_overrides(&args);

        assert_eq!(cfg.mixer.device.as_deref(), Some("Speakers"));
        assert_eq!(cfg.mixer.buffer_seconds, 4.0);
        assert_eq!(cfg.player.lead_ms, 250);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PlayerFileConfig::load(Path::new("/nonexistent/track-player.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("read config"));
    }
}

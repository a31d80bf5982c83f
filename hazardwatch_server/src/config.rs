//! Command-line / environment configuration for the server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use h3o::Resolution;
use hazardwatch_core::EngineConfig;

const HOUR_MS: f64 = 3_600_000.0;

/// HazardWatch corroboration server
#[derive(Parser, Debug, Clone)]
#[command(name = "hazardwatch-server")]
#[command(about = "Serve crowd-sourced road hazard reports over HTTP", long_about = None)]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "HAZARDWATCH_BIND", default_value = "0.0.0.0:8080")]
    pub bind: SocketAddr,

    /// Sled data directory (in-memory store when absent)
    #[arg(long, env = "HAZARDWATCH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// "Same spot" distance in meters
    #[arg(long, env = "HAZARDWATCH_RADIUS_M", default_value = "50")]
    pub radius_m: f64,

    /// "Same time" window in hours
    #[arg(long, env = "HAZARDWATCH_WINDOW_HOURS", default_value = "72")]
    pub window_hours: f64,

    /// Distinct reporters needed to verify a hazard
    #[arg(long, env = "HAZARDWATCH_THRESHOLD", default_value = "2")]
    pub threshold: usize,

    /// H3 resolution of the spatial grid
    #[arg(long, env = "HAZARDWATCH_H3_RESOLUTION", default_value = "9")]
    pub h3_resolution: u8,

    /// Seconds between expiry sweeps
    #[arg(long, env = "HAZARDWATCH_SWEEP_SECS", default_value = "60")]
    pub sweep_secs: u64,
}

impl Args {
    /// Engine settings derived from the flags, defaults elsewhere.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            anyhow::bail!("--radius-m must be a positive number, got {}", self.radius_m);
        }
        if !self.window_hours.is_finite() || self.window_hours <= 0.0 {
            anyhow::bail!(
                "--window-hours must be a positive number, got {}",
                self.window_hours
            );
        }
        if self.threshold == 0 {
            anyhow::bail!("--threshold must be at least 1");
        }
        let h3_resolution = Resolution::try_from(self.h3_resolution)
            .with_context(|| format!("invalid --h3-resolution {}", self.h3_resolution))?;

        Ok(EngineConfig {
            h3_resolution,
            match_radius_m: self.radius_m,
            match_window_ms: (self.window_hours * HOUR_MS).round() as i64,
            verify_threshold: self.threshold,
            ..EngineConfig::default()
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["hazardwatch-server"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_match_engine_defaults() {
        let config = parse(&[]).engine_config().unwrap();
        let defaults = EngineConfig::default();

        assert_eq!(config.h3_resolution, defaults.h3_resolution);
        assert_eq!(config.match_radius_m, defaults.match_radius_m);
        assert_eq!(config.match_window_ms, defaults.match_window_ms);
        assert_eq!(config.verify_threshold, defaults.verify_threshold);
    }

    #[test]
    fn test_flags_override_engine_config() {
        let args = parse(&[
            "--radius-m",
            "25",
            "--window-hours",
            "1.5",
            "--threshold",
            "3",
            "--h3-resolution",
            "10",
            "--sweep-secs",
            "5",
        ]);
        let config = args.engine_config().unwrap();

        assert_eq!(config.match_radius_m, 25.0);
        assert_eq!(config.match_window_ms, 5_400_000);
        assert_eq!(config.verify_threshold, 3);
        assert_eq!(config.h3_resolution, Resolution::Ten);
        assert_eq!(args.sweep_interval(), Duration::from_secs(5));
        assert!(args.data_dir.is_none());
    }

    #[test]
    fn test_rejects_unusable_values() {
        assert!(parse(&["--radius-m", "0"]).engine_config().is_err());
        assert!(parse(&["--window-hours=-1"]).engine_config().is_err());
        assert!(parse(&["--threshold", "0"]).engine_config().is_err());
        assert!(parse(&["--h3-resolution", "16"]).engine_config().is_err());
    }
}

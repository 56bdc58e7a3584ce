use crate::error::{ThrottleError, ThrottleResult};
use crate::rate_limit_config::{MaximumBurst, ThrottleConfig, ThrottleMode};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// How the binary weighs each line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CostBy {
    /// One unit per line.
    Lines,
    /// One unit per byte, newline included.
    Bytes,
}

/// Command line and environment configuration for the `throttle-stage` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "throttle-stage", version, about = "Throttle lines from stdin to stdout")]
pub struct Config {
    /// JSON throttle configuration; overrides the individual rate flags
    #[arg(long, env = "THROTTLE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Units admitted per period
    #[arg(long, env = "THROTTLE_COST", default_value_t = 1)]
    pub cost: u64,

    /// Period over which `cost` units are admitted, e.g. "100ms"
    #[arg(long, env = "THROTTLE_PER", default_value = "1s", value_parser = parse_period)]
    pub per: Duration,

    /// Maximum burst in units, or "auto"
    #[arg(long, env = "THROTTLE_BURST", default_value = "auto")]
    pub burst: MaximumBurst,

    /// "shaping" delays excess lines, "enforcing" fails on them
    #[arg(long, env = "THROTTLE_MODE", default_value = "shaping")]
    pub mode: ThrottleMode,

    /// What a single unit of cost measures
    #[arg(long, value_enum, default_value_t = CostBy::Lines)]
    pub cost_by: CostBy,

    /// Capacity of the channels on either side of the throttle
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u64).range(1..))]
    pub buffer: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

fn parse_period(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|e| e.to_string())
}

impl Config {
    /// The throttle settings, read from `--config` when given.
    pub fn throttle_config(&self) -> ThrottleResult<ThrottleConfig> {
        match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    ThrottleError::configuration(format!(
                        "cannot read {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                ThrottleConfig::from_json_str(&json)
            }
            None => {
                let config = ThrottleConfig::new(self.cost, self.per, self.burst, self.mode);
                config.resolve()?;
                Ok(config)
            }
        }
    }

    pub fn buffer(&self) -> usize {
        usize::try_from(self.buffer).unwrap_or(usize::MAX)
    }
}

use crate::error::{ThrottleError, ThrottleResult};
use crate::token_bucket::automatic_capacity;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// How a throttle treats items that arrive faster than the configured rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleMode {
    /// Delay non-conforming items until they conform.
    #[default]
    Shaping,
    /// Fail the stage on the first non-conforming item.
    Enforcing,
}

impl fmt::Display for ThrottleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleMode::Shaping => write!(f, "shaping"),
            ThrottleMode::Enforcing => write!(f, "enforcing"),
        }
    }
}

impl FromStr for ThrottleMode {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shaping" => Ok(ThrottleMode::Shaping),
            "enforcing" => Ok(ThrottleMode::Enforcing),
            other => Err(ThrottleError::configuration(format!(
                "unknown throttle mode '{}', expected 'shaping' or 'enforcing'",
                other
            ))),
        }
    }
}

/// Burst capacity of the bucket, in cost units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "BurstRepr", into = "BurstRepr")]
pub enum MaximumBurst {
    /// Sized from the rate so that 100ms of traffic can pass at once.
    #[default]
    Automatic,
    Fixed(u64),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum BurstRepr {
    Fixed(u64),
    Named(String),
}

impl TryFrom<BurstRepr> for MaximumBurst {
    type Error = ThrottleError;

    fn try_from(repr: BurstRepr) -> Result<Self, Self::Error> {
        match repr {
            BurstRepr::Fixed(n) => Ok(MaximumBurst::Fixed(n)),
            BurstRepr::Named(name) => name.parse(),
        }
    }
}

impl From<MaximumBurst> for BurstRepr {
    fn from(burst: MaximumBurst) -> Self {
        match burst {
            MaximumBurst::Automatic => BurstRepr::Named("auto".to_string()),
            MaximumBurst::Fixed(n) => BurstRepr::Fixed(n),
        }
    }
}

impl fmt::Display for MaximumBurst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaximumBurst::Automatic => write!(f, "auto"),
            MaximumBurst::Fixed(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for MaximumBurst {
    type Err = ThrottleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") || s.eq_ignore_ascii_case("automatic") {
            return Ok(MaximumBurst::Automatic);
        }
        s.parse::<u64>().map(MaximumBurst::Fixed).map_err(|_| {
            ThrottleError::configuration(format!(
                "invalid maximum burst '{}', expected 'auto' or a non-negative integer",
                s
            ))
        })
    }
}

/// Throttle settings: `cost` units may pass every `per`, with bursts up to
/// `maximum_burst`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ThrottleConfig {
    #[validate(range(min = 1, message = "cost must be greater than 0"))]
    pub cost: u64,

    #[serde(with = "humantime_serde")]
    #[validate(custom(function = "validate_period"))]
    pub per: Duration,

    #[serde(default)]
    pub maximum_burst: MaximumBurst,

    #[serde(default)]
    pub mode: ThrottleMode,
}

/// Bucket parameters derived from a [`ThrottleConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketSpec {
    pub capacity: u64,
    pub nanos_between_tokens: u64,
}

fn validate_period(per: &Duration) -> Result<(), ValidationError> {
    if per.is_zero() {
        let mut err = ValidationError::new("period");
        err.message = Some("period must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            cost: 1,
            per: Duration::from_secs(1),
            maximum_burst: MaximumBurst::Automatic,
            mode: ThrottleMode::Shaping,
        }
    }
}

impl ThrottleConfig {
    pub fn new(cost: u64, per: Duration, maximum_burst: MaximumBurst, mode: ThrottleMode) -> Self {
        Self {
            cost,
            per,
            maximum_burst,
            mode,
        }
    }

    pub fn shaping(cost: u64, per: Duration) -> Self {
        Self::new(cost, per, MaximumBurst::Automatic, ThrottleMode::Shaping)
    }

    pub fn enforcing(cost: u64, per: Duration, maximum_burst: MaximumBurst) -> Self {
        Self::new(cost, per, maximum_burst, ThrottleMode::Enforcing)
    }

    /// Parse a JSON document such as
    /// `{"cost": 1, "per": "100ms", "maximum_burst": "auto", "mode": "shaping"}`.
    pub fn from_json_str(json: &str) -> ThrottleResult<Self> {
        let config: ThrottleConfig = serde_json::from_str(json)?;
        config.resolve()?;
        Ok(config)
    }

    /// Validates the settings and derives the bucket parameters.
    pub fn resolve(&self) -> ThrottleResult<BucketSpec> {
        self.validate()?;

        let per_nanos = self.per.as_nanos();
        if per_nanos < u128::from(self.cost) {
            return Err(ThrottleError::configuration(format!(
                "rates larger than 1 unit per nanosecond are not supported ({} units per {:?})",
                self.cost, self.per
            )));
        }
        let nanos_between_tokens = u64::try_from(per_nanos / u128::from(self.cost))
            .map_err(|_| ThrottleError::configuration(format!("period {:?} is too long", self.per)))?;

        let capacity = match self.maximum_burst {
            MaximumBurst::Automatic => automatic_capacity(nanos_between_tokens),
            MaximumBurst::Fixed(n) => n,
        };
        if capacity == 0 && self.mode == ThrottleMode::Enforcing {
            return Err(ThrottleError::configuration(
                "maximum burst must be greater than 0 in enforcing mode",
            ));
        }

        Ok(BucketSpec {
            capacity,
            nanos_between_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_throttle_config_default() {
        let config = ThrottleConfig::default();
        assert_eq!(config.cost, 1);
        assert_eq!(config.per, Duration::from_secs(1));
        assert_eq!(config.maximum_burst, MaximumBurst::Automatic);
        assert_eq!(config.mode, ThrottleMode::Shaping);
    }

    #[test]
    fn test_resolve_automatic_burst() {
        let resolved = assert_ok!(ThrottleConfig::shaping(1, Duration::from_millis(100)).resolve());
        assert_eq!(resolved.nanos_between_tokens, 100_000_000);
        assert_eq!(resolved.capacity, 1);

        let resolved = assert_ok!(ThrottleConfig::shaping(1000, Duration::from_secs(1)).resolve());
        assert_eq!(resolved.nanos_between_tokens, 1_000_000);
        assert_eq!(resolved.capacity, 100);
    }

    #[test]
    fn test_resolve_fixed_burst() {
        let config = ThrottleConfig::enforcing(10, Duration::from_secs(1), MaximumBurst::Fixed(25));
        let resolved = assert_ok!(config.resolve());
        assert_eq!(resolved.nanos_between_tokens, 100_000_000);
        assert_eq!(resolved.capacity, 25);
    }

    #[test]
    fn test_zero_cost_rejected() {
        let config = ThrottleConfig::shaping(0, Duration::from_secs(1));
        let err = assert_err!(config.resolve());
        assert!(matches!(err, ThrottleError::Configuration(_)));
    }

    #[test]
    fn test_zero_period_rejected() {
        let config = ThrottleConfig::shaping(1, Duration::ZERO);
        assert_err!(config.resolve());
    }

    #[test]
    fn test_sub_nanosecond_rate_rejected() {
        let config = ThrottleConfig::shaping(10, Duration::from_nanos(5));
        let err = assert_err!(config.resolve());
        assert!(err.to_string().contains("1 unit per nanosecond"));

        // Exactly one unit per nanosecond is fine.
        assert_ok!(ThrottleConfig::shaping(5, Duration::from_nanos(5)).resolve());
    }

    #[test]
    fn test_zero_burst_only_allowed_when_shaping() {
        let enforcing = ThrottleConfig::enforcing(1, Duration::from_secs(1), MaximumBurst::Fixed(0));
        assert_err!(enforcing.resolve());

        let shaping = ThrottleConfig::new(
            1,
            Duration::from_secs(1),
            MaximumBurst::Fixed(0),
            ThrottleMode::Shaping,
        );
        assert_eq!(assert_ok!(shaping.resolve()).capacity, 0);
    }

    #[test]
    fn test_from_json() {
        let config = assert_ok!(ThrottleConfig::from_json_str(
            r#"{"cost": 2, "per": "100ms", "maximum_burst": "auto", "mode": "enforcing"}"#
        ));
        assert_eq!(config.cost, 2);
        assert_eq!(config.per, Duration::from_millis(100));
        assert_eq!(config.maximum_burst, MaximumBurst::Automatic);
        assert_eq!(config.mode, ThrottleMode::Enforcing);

        let config = assert_ok!(ThrottleConfig::from_json_str(
            r#"{"cost": 1, "per": "1s", "maximum_burst": 40}"#
        ));
        assert_eq!(config.maximum_burst, MaximumBurst::Fixed(40));
        assert_eq!(config.mode, ThrottleMode::Shaping);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert_err!(ThrottleConfig::from_json_str(r#"{"cost": 0, "per": "1s"}"#));
        assert_err!(ThrottleConfig::from_json_str(r#"{"cost": 1, "per": "1s", "maximum_burst": "lots"}"#));
        assert_err!(ThrottleConfig::from_json_str(r#"{"cost": 1, "per": "1s", "mode": "dropping"}"#));
    }

    #[test]
    fn test_json_round_trip_keeps_auto() {
        let config = ThrottleConfig::shaping(3, Duration::from_millis(250));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains(r#""maximum_burst":"auto""#));
        assert!(json.contains(r#""per":"250ms""#));
    }

    #[test]
    fn test_parse_mode_and_burst() {
        assert_eq!("Enforcing".parse::<ThrottleMode>().unwrap(), ThrottleMode::Enforcing);
        assert!("drop".parse::<ThrottleMode>().is_err());
        assert_eq!("auto".parse::<MaximumBurst>().unwrap(), MaximumBurst::Automatic);
        assert_eq!("12".parse::<MaximumBurst>().unwrap(), MaximumBurst::Fixed(12));
        assert!("-1".parse::<MaximumBurst>().is_err());
        assert_eq!(MaximumBurst::Fixed(7).to_string(), "7");
    }
}

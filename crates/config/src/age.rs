//! Age thresholds such as `"24 hours"` or `"7 days"`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unit of an [`AgeThreshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl AgeUnit {
    fn seconds(self) -> u64 {
        match self {
            AgeUnit::Minutes => 60,
            AgeUnit::Hours => 60 * 60,
            AgeUnit::Days => 24 * 60 * 60,
            AgeUnit::Weeks => 7 * 24 * 60 * 60,
        }
    }

    fn label(self, value: u32) -> &'static str {
        match (self, value == 1) {
            (AgeUnit::Minutes, true) => "minute",
            (AgeUnit::Minutes, false) => "minutes",
            (AgeUnit::Hours, true) => "hour",
            (AgeUnit::Hours, false) => "hours",
            (AgeUnit::Days, true) => "day",
            (AgeUnit::Days, false) => "days",
            (AgeUnit::Weeks, true) => "week",
            (AgeUnit::Weeks, false) => "weeks",
        }
    }
}

/// A configurable age limit, written as `<value> <unit>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgeThreshold {
    pub value: u32,
    pub unit: AgeUnit,
}

/// Error returned when an age threshold string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAgeError(pub String);

impl fmt::Display for ParseAgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid age threshold '{}': expected e.g. \"24 hours\"", self.0)
    }
}

impl std::error::Error for ParseAgeError {}

impl AgeThreshold {
    pub fn new(value: u32, unit: AgeUnit) -> Self {
        Self { value, unit }
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.value) * self.unit.seconds())
    }
}

impl FromStr for AgeThreshold {
    type Err = ParseAgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseAgeError(s.to_string());
        let mut parts = s.split_whitespace();
        let value: u32 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let unit = match parts.next().ok_or_else(err)?.to_lowercase().as_str() {
            "minute" | "minutes" | "min" | "mins" => AgeUnit::Minutes,
            "hour" | "hours" | "h" => AgeUnit::Hours,
            "day" | "days" | "d" => AgeUnit::Days,
            "week" | "weeks" | "w" => AgeUnit::Weeks,
            _ => return Err(err()),
        };
        if value == 0 || parts.next().is_some() {
            return Err(err());
        }
        Ok(Self { value, unit })
    }
}

impl fmt::Display for AgeThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit.label(self.value))
    }
}

impl TryFrom<String> for AgeThreshold {
    type Error = ParseAgeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AgeThreshold> for String {
    fn from(value: AgeThreshold) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_common_forms() {
        assert_eq!(
            "24 hours".parse::<AgeThreshold>().unwrap(),
            AgeThreshold::new(24, AgeUnit::Hours)
        );
        assert_eq!(
            "7 days".parse::<AgeThreshold>().unwrap(),
            AgeThreshold::new(7, AgeUnit::Days)
        );
        assert_eq!(
            "1 Week".parse::<AgeThreshold>().unwrap(),
            AgeThreshold::new(1, AgeUnit::Weeks)
        );
    }

    #[test]
    fn test_rejects_zero_and_garbage() {
        assert!("0 days".parse::<AgeThreshold>().is_err());
        assert!("seven days".parse::<AgeThreshold>().is_err());
        assert!("7 fortnights".parse::<AgeThreshold>().is_err());
        assert!("7".parse::<AgeThreshold>().is_err());
        assert!("7 days ago".parse::<AgeThreshold>().is_err());
    }

    #[test]
    fn test_duration() {
        let t = AgeThreshold::new(2, AgeUnit::Hours);
        assert_eq!(t.as_duration(), Duration::from_secs(7200));
    }

    proptest! {
        #[test]
        fn prop_display_parses_back(
            value in 1u32..10_000,
            unit in prop_oneof![
                Just(AgeUnit::Minutes),
                Just(AgeUnit::Hours),
                Just(AgeUnit::Days),
                Just(AgeUnit::Weeks),
            ],
        ) {
            let threshold = AgeThreshold::new(value, unit);
            let parsed: AgeThreshold = threshold.to_string().parse().unwrap();
            prop_assert_eq!(parsed, threshold);
        }
    }
}

// src/config/duration.rs
//! Go-style duration strings (`"30s"`, `"15m"`, `"1h30m"`, `"250ms"`).

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::time::Duration;

static RE_PART: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ns|us|µs|ms|s|m|h)").expect("duration part regex"));
static RE_FULL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)?(?:ns|us|µs|ms|s|m|h))+$").expect("duration full regex")
});

pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() || !RE_FULL.is_match(s) {
        return Err(anyhow!("invalid duration `{input}`"));
    }

    let mut secs = 0f64;
    for caps in RE_PART.captures_iter(s) {
        let value: f64 = caps[1]
            .parse()
            .map_err(|_| anyhow!("invalid number in duration `{input}`"))?;
        let unit = match &caps[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => return Err(anyhow!("unknown duration unit `{other}`")),
        };
        secs += value * unit;
    }
    Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("duration `{input}` out of range: {e}"))
}

pub(crate) fn deserialize<'de, D>(de: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "10", "ten minutes", "5d", "1h 30m", "-5s"] {
            assert!(parse_duration(bad).is_err(), "{bad:?} should not parse");
        }
    }

    #[test]
    fn rejects_values_too_large_for_a_duration() {
        let err = parse_duration("99999999999999999999999h").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }
}

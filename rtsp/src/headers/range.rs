use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use shared::error::{Error, Result};

/// One end of an NPT range.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum NptTime {
    /// The live edge: `npt=now-`.
    Now,
    Seconds(f64),
}

impl NptTime {
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            NptTime::Now => None,
            NptTime::Seconds(s) => Some(Duration::from_secs_f64(*s)),
        }
    }
}

impl fmt::Display for NptTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NptTime::Now => write!(f, "now"),
            NptTime::Seconds(s) => write!(f, "{s:.3}"),
        }
    }
}

/// A `Range:` header in normal-play-time form (RFC 2326 §12.29):
/// `npt=<start>-[<end>]` or `npt=now-`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct NptRange {
    pub start: NptTime,
    pub end: Option<f64>,
}

impl NptRange {
    pub fn from_start(secs: f64) -> Self {
        NptRange {
            start: NptTime::Seconds(secs),
            end: None,
        }
    }

    pub fn now() -> Self {
        NptRange {
            start: NptTime::Now,
            end: None,
        }
    }
}

fn parse_npt_seconds(v: &str) -> Result<f64> {
    // "h:mm:ss.fraction" or plain seconds
    let fields: Vec<&str> = v.split(':').collect();
    let secs = match fields.as_slice() {
        [s] => s
            .parse::<f64>()
            .map_err(|_| Error::MalformedHeader("Range".to_owned(), v.to_owned()))?,
        [h, m, s] => {
            let h: f64 = h
                .parse()
                .map_err(|_| Error::MalformedHeader("Range".to_owned(), v.to_owned()))?;
            let m: f64 = m
                .parse()
                .map_err(|_| Error::MalformedHeader("Range".to_owned(), v.to_owned()))?;
            let s: f64 = s
                .parse()
                .map_err(|_| Error::MalformedHeader("Range".to_owned(), v.to_owned()))?;
            h * 3600.0 + m * 60.0 + s
        }
        _ => return Err(Error::MalformedHeader("Range".to_owned(), v.to_owned())),
    };
    if secs < 0.0 {
        return Err(Error::MalformedHeader("Range".to_owned(), v.to_owned()));
    }
    Ok(secs)
}

impl FromStr for NptRange {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let spec = s
            .strip_prefix("npt=")
            .ok_or_else(|| Error::MalformedHeader("Range".to_owned(), s.to_owned()))?;
        let (start_str, end_str) = spec
            .split_once('-')
            .ok_or_else(|| Error::MalformedHeader("Range".to_owned(), s.to_owned()))?;

        let start = if start_str == "now" {
            NptTime::Now
        } else {
            NptTime::Seconds(parse_npt_seconds(start_str)?)
        };
        let end = if end_str.is_empty() {
            None
        } else {
            Some(parse_npt_seconds(end_str)?)
        };

        Ok(NptRange { start, end })
    }
}

impl fmt::Display for NptRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "npt={}-{end:.3}", self.start),
            None => write!(f, "npt={}-", self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_dash() {
        let r: NptRange = "npt=now-".parse().unwrap();
        assert_eq!(r.start, NptTime::Now);
        assert_eq!(r.end, None);
        assert_eq!(r.to_string(), "npt=now-");
    }

    #[test]
    fn test_start_only() {
        let r: NptRange = "npt=1.500-".parse().unwrap();
        assert_eq!(r.start, NptTime::Seconds(1.5));
        assert_eq!(r.to_string(), "npt=1.500-");
    }

    #[test]
    fn test_start_end() {
        let r: NptRange = "npt=0-7.741".parse().unwrap();
        assert_eq!(r.start, NptTime::Seconds(0.0));
        assert_eq!(r.end, Some(7.741));
    }

    #[test]
    fn test_hms_form() {
        let r: NptRange = "npt=0:10:05.25-".parse().unwrap();
        assert_eq!(r.start, NptTime::Seconds(605.25));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!("clock=19961108T143720Z-".parse::<NptRange>().is_err());
        assert!("npt=abc-".parse::<NptRange>().is_err());
    }
}

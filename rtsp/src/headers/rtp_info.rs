use std::fmt;
use std::str::FromStr;

use shared::error::{Error, Result};

/// One media entry of an `RTP-Info:` header (RFC 2326 §12.33).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpInfoEntry {
    pub url: String,
    /// Sequence number of the first packet of the stream after PLAY.
    pub seq: Option<u16>,
    /// RTP timestamp corresponding to the start of the range.
    pub rtptime: Option<u32>,
}

/// The `RTP-Info:` header: a comma-separated list of per-media entries
/// returned on PLAY.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RtpInfo(pub Vec<RtpInfoEntry>);

impl RtpInfo {
    pub fn entry_for(&self, control_url: &str) -> Option<&RtpInfoEntry> {
        self.0.iter().find(|e| e.url == control_url)
    }
}

impl FromStr for RtpInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for item in s.split(',') {
            let mut url = None;
            let mut seq = None;
            let mut rtptime = None;
            for field in item.trim().split(';') {
                let (key, value) = match field.split_once('=') {
                    Some((k, v)) => (k.trim(), v.trim()),
                    None => continue,
                };
                match key {
                    "url" => url = Some(value.to_owned()),
                    "seq" => {
                        seq = Some(value.parse().map_err(|_| {
                            Error::MalformedHeader("RTP-Info".to_owned(), s.to_owned())
                        })?)
                    }
                    "rtptime" => {
                        rtptime = Some(value.parse().map_err(|_| {
                            Error::MalformedHeader("RTP-Info".to_owned(), s.to_owned())
                        })?)
                    }
                    _ => {}
                }
            }
            let url =
                url.ok_or_else(|| Error::MalformedHeader("RTP-Info".to_owned(), s.to_owned()))?;
            entries.push(RtpInfoEntry { url, seq, rtptime });
        }
        if entries.is_empty() {
            return Err(Error::MalformedHeader("RTP-Info".to_owned(), s.to_owned()));
        }
        Ok(RtpInfo(entries))
    }
}

impl fmt::Display for RtpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "url={}", e.url)?;
            if let Some(seq) = e.seq {
                write!(f, ";seq={seq}")?;
            }
            if let Some(rtptime) = e.rtptime {
                write!(f, ";rtptime={rtptime}")?;
            }
        }
        Ok(())
    }
}

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use shared::error::{Error, Result};

/// The `m=` line media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
    Application,
    Other(String),
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "video" => MediaType::Video,
            "audio" => MediaType::Audio,
            "application" => MediaType::Application,
            other => MediaType::Other(other.to_owned()),
        })
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
            MediaType::Application => write!(f, "application"),
            MediaType::Other(s) => write!(f, "{s}"),
        }
    }
}

impl Default for MediaType {
    fn default() -> Self {
        MediaType::Video
    }
}

/// RTP profile from the `m=` line: plain AVP or secure SAVP.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransportProfile {
    #[default]
    Avp,
    Savp,
}

impl FromStr for TransportProfile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RTP/AVP" => Ok(TransportProfile::Avp),
            "RTP/SAVP" => Ok(TransportProfile::Savp),
            other => Err(Error::InvalidSdp(format!("unknown profile {other}"))),
        }
    }
}

impl fmt::Display for TransportProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProfile::Avp => write!(f, "RTP/AVP"),
            TransportProfile::Savp => write!(f, "RTP/SAVP"),
        }
    }
}

/// Stream direction attribute.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    SendOnly,
    RecvOnly,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::SendOnly => write!(f, "sendonly"),
            Direction::RecvOnly => write!(f, "recvonly"),
        }
    }
}

/// A payload format of a media: the `rtpmap` and `fmtp` state for one
/// payload type.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Format {
    /// Payload type byte, 0..=127.
    pub payload_type: u8,
    /// Encoding name from `a=rtpmap:` (e.g. `H264`, `MPEG4-GENERIC`).
    pub encoding_name: String,
    /// RTP clock rate in Hz.
    pub clock_rate: u32,
    /// Channel count for audio formats that declare one.
    pub channels: Option<u8>,
    /// The verbatim `a=fmtp:` parameter string (`packetization-mode=1;
    /// sprop-parameter-sets=...`, AAC `config=...`, ...).
    pub parameters: Option<String>,
}

impl Format {
    /// The `a=rtpmap:` value for this format, when it carries one.
    pub fn rtpmap(&self) -> Option<String> {
        if self.encoding_name.is_empty() || self.clock_rate == 0 {
            return None;
        }
        let mut s = format!("{} {}/{}", self.payload_type, self.encoding_name, self.clock_rate);
        if let Some(ch) = self.channels {
            s.push_str(&format!("/{ch}"));
        }
        Some(s)
    }

    /// Presentation time of `timestamp` relative to `base`, computed with
    /// wrap-aware 32-bit arithmetic against the format clock rate.
    pub fn pts(&self, base: u32, timestamp: u32) -> Duration {
        if self.clock_rate == 0 {
            return Duration::ZERO;
        }
        let delta = timestamp.wrapping_sub(base) as u64;
        Duration::from_nanos(delta * 1_000_000_000 / self.clock_rate as u64)
    }

    /// RFC 3551 §6 static payload type assignments, used when a media lists
    /// a payload type without an `a=rtpmap:`.
    pub fn from_static_payload_type(pt: u8) -> Option<Format> {
        let (name, clock_rate, channels) = match pt {
            0 => ("PCMU", 8000, Some(1)),
            8 => ("PCMA", 8000, Some(1)),
            9 => ("G722", 8000, Some(1)),
            10 => ("L16", 44100, Some(2)),
            11 => ("L16", 44100, Some(1)),
            14 => ("MPA", 90000, None),
            26 => ("JPEG", 90000, None),
            32 => ("MPV", 90000, None),
            33 => ("MP2T", 90000, None),
            _ => return None,
        };
        Some(Format {
            payload_type: pt,
            encoding_name: name.to_owned(),
            clock_rate,
            channels,
            parameters: None,
        })
    }
}

/// One `m=` block of a session description.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MediaDescription {
    pub media_type: MediaType,
    pub profile: TransportProfile,
    pub formats: Vec<Format>,
    /// The per-media `a=control:` token. Filled by
    /// [`SessionDescription::prepare`](crate::SessionDescription::prepare)
    /// when absent.
    pub control: Option<String>,
    pub direction: Option<Direction>,
    /// Decoded `a=key-mgmt:mikey` blob.
    pub key_mgmt: Option<Vec<u8>>,
}

impl MediaDescription {
    /// Whether this media is a server-to-client back channel
    /// (`a=sendonly` on an announced recording media).
    pub fn is_back_channel(&self) -> bool {
        self.direction == Some(Direction::SendOnly)
    }

    pub fn format_by_payload_type(&self, pt: u8) -> Option<&Format> {
        self.formats.iter().find(|f| f.payload_type == pt)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for (i, f) in self.formats.iter().enumerate() {
            if self.formats[..i].iter().any(|g| g.payload_type == f.payload_type) {
                return Err(Error::DuplicatePayloadType(f.payload_type));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtpmap_with_channels() {
        let f = Format {
            payload_type: 97,
            encoding_name: "MPEG4-GENERIC".to_owned(),
            clock_rate: 48000,
            channels: Some(2),
            parameters: None,
        };
        assert_eq!(f.rtpmap().unwrap(), "97 MPEG4-GENERIC/48000/2");
    }

    #[test]
    fn test_pts_wraps() {
        let f = Format {
            payload_type: 96,
            encoding_name: "H264".to_owned(),
            clock_rate: 90000,
            ..Default::default()
        };
        assert_eq!(f.pts(0, 90000), Duration::from_secs(1));
        // one tick past the 32-bit wrap
        assert_eq!(
            f.pts(u32::MAX, 90000 - 1),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_static_payload_types() {
        let f = Format::from_static_payload_type(0).unwrap();
        assert_eq!(f.encoding_name, "PCMU");
        assert_eq!(f.clock_rate, 8000);
        assert!(Format::from_static_payload_type(96).is_none());
    }

    #[test]
    fn test_duplicate_payload_type() {
        let m = MediaDescription {
            formats: vec![
                Format {
                    payload_type: 96,
                    ..Default::default()
                },
                Format {
                    payload_type: 96,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(m.validate(), Err(Error::DuplicatePayloadType(96)));
    }
}

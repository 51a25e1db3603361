use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use shared::error::{Error, Result};

/// Lower transport of the media plane.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

/// Delivery mode parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

/// `mode=` parameter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransportMode {
    Play,
    Record,
}

/// The negotiated transport shape of a session, with its port or channel
/// pair (even = RTP, odd = RTCP).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransportKind {
    UdpUnicast,
    UdpMulticast,
    TcpInterleaved,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::UdpUnicast => write!(f, "UDP-unicast"),
            TransportKind::UdpMulticast => write!(f, "UDP-multicast"),
            TransportKind::TcpInterleaved => write!(f, "TCP-interleaved"),
        }
    }
}

/// A parsed `Transport:` header (RFC 2326 §12.39):
///
/// ```text
/// RTP/AVP[/(UDP|TCP)];(unicast|multicast);(client_port=a-b|interleaved=a-b|
/// port=a-b|destination=<ip>);[ssrc=...];[mode=(play|record)]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportHeader {
    pub protocol: TransportProtocol,
    /// True for the SAVP (SRTP) profile.
    pub secure: bool,
    pub delivery: Option<Delivery>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    /// Multicast port pair.
    pub port: Option<(u16, u16)>,
    pub destination: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub ttl: Option<u8>,
    pub ssrc: Option<u32>,
    pub mode: Option<TransportMode>,
}

impl TransportHeader {
    /// Classifies the header into one of the three transport kinds.
    pub fn kind(&self) -> Result<TransportKind> {
        if self.protocol == TransportProtocol::Tcp || self.interleaved.is_some() {
            return Ok(TransportKind::TcpInterleaved);
        }
        match self.delivery {
            Some(Delivery::Multicast) => Ok(TransportKind::UdpMulticast),
            _ => Ok(TransportKind::UdpUnicast),
        }
    }
}

fn parse_port_pair(v: &str) -> Result<(u16, u16)> {
    let (a, b) = match v.split_once('-') {
        Some((a, b)) => {
            let a: u16 = a.trim().parse()?;
            let b: u16 = b.trim().parse()?;
            (a, b)
        }
        None => {
            let a: u16 = v.trim().parse()?;
            (a, a + 1)
        }
    };
    Ok((a, b))
}

fn parse_channel_pair(v: &str) -> Result<(u8, u8)> {
    let (a, b) = parse_port_pair(v)?;
    if a > u8::MAX as u16 || b > u8::MAX as u16 {
        return Err(Error::MalformedHeader(
            "Transport".to_owned(),
            format!("interleaved channel {v} out of range"),
        ));
    }
    Ok((a as u8, b as u8))
}

impl FromStr for TransportHeader {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let spec = parts
            .next()
            .ok_or_else(|| Error::MalformedHeader("Transport".to_owned(), s.to_owned()))?
            .trim();

        let mut th = TransportHeader::default();
        match spec {
            "RTP/AVP" | "RTP/AVP/UDP" => {}
            "RTP/AVP/TCP" => th.protocol = TransportProtocol::Tcp,
            "RTP/SAVP" | "RTP/SAVP/UDP" => th.secure = true,
            "RTP/SAVP/TCP" => {
                th.secure = true;
                th.protocol = TransportProtocol::Tcp;
            }
            other => {
                return Err(Error::MalformedHeader(
                    "Transport".to_owned(),
                    format!("unknown spec {other}"),
                ));
            }
        }

        for part in parts {
            let part = part.trim();
            let (key, value) = match part.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (part, None),
            };
            match (key, value) {
                ("unicast", None) => th.delivery = Some(Delivery::Unicast),
                ("multicast", None) => th.delivery = Some(Delivery::Multicast),
                ("client_port", Some(v)) => th.client_port = Some(parse_port_pair(v)?),
                ("server_port", Some(v)) => th.server_port = Some(parse_port_pair(v)?),
                ("interleaved", Some(v)) => th.interleaved = Some(parse_channel_pair(v)?),
                ("port", Some(v)) => th.port = Some(parse_port_pair(v)?),
                ("destination", Some(v)) => {
                    th.destination = Some(v.parse().map_err(|_| {
                        Error::MalformedHeader("Transport".to_owned(), format!("destination {v}"))
                    })?)
                }
                ("source", Some(v)) => {
                    th.source = Some(v.parse().map_err(|_| {
                        Error::MalformedHeader("Transport".to_owned(), format!("source {v}"))
                    })?)
                }
                ("ttl", Some(v)) => th.ttl = Some(v.parse()?),
                ("ssrc", Some(v)) => {
                    th.ssrc = Some(u32::from_str_radix(v.trim(), 16).map_err(|_| {
                        Error::MalformedHeader("Transport".to_owned(), format!("ssrc {v}"))
                    })?)
                }
                ("mode", Some(v)) => {
                    let v = v.trim_matches('"');
                    th.mode = Some(match v {
                        "play" | "PLAY" => TransportMode::Play,
                        "record" | "RECORD" => TransportMode::Record,
                        other => {
                            return Err(Error::MalformedHeader(
                                "Transport".to_owned(),
                                format!("mode {other}"),
                            ));
                        }
                    });
                }
                // unknown parameters are tolerated
                _ => {}
            }
        }

        Ok(th)
    }
}

impl fmt::Display for TransportHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let profile = if self.secure { "SAVP" } else { "AVP" };
        match self.protocol {
            TransportProtocol::Udp => write!(f, "RTP/{profile}")?,
            TransportProtocol::Tcp => write!(f, "RTP/{profile}/TCP")?,
        }
        match self.delivery {
            Some(Delivery::Unicast) => write!(f, ";unicast")?,
            Some(Delivery::Multicast) => write!(f, ";multicast")?,
            None => {}
        }
        if let Some(ip) = self.destination {
            write!(f, ";destination={ip}")?;
        }
        if let Some((a, b)) = self.client_port {
            write!(f, ";client_port={a}-{b}")?;
        }
        if let Some((a, b)) = self.server_port {
            write!(f, ";server_port={a}-{b}")?;
        }
        if let Some((a, b)) = self.interleaved {
            write!(f, ";interleaved={a}-{b}")?;
        }
        if let Some((a, b)) = self.port {
            write!(f, ";port={a}-{b}")?;
        }
        if let Some(ip) = self.source {
            write!(f, ";source={ip}")?;
        }
        if let Some(ttl) = self.ttl {
            write!(f, ";ttl={ttl}")?;
        }
        if let Some(ssrc) = self.ssrc {
            write!(f, ";ssrc={ssrc:08X}")?;
        }
        match self.mode {
            Some(TransportMode::Play) => write!(f, ";mode=play")?,
            Some(TransportMode::Record) => write!(f, ";mode=record")?,
            None => {}
        }
        Ok(())
    }
}

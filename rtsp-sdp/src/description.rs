use std::fmt;
use std::net::IpAddr;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use shared::error::{Error, Result};

use crate::media::{Direction, Format, MediaDescription, MediaType, TransportProfile};

/// The `o=` originator line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub unicast_address: String,
}

impl Default for Origin {
    fn default() -> Self {
        Origin {
            username: "-".to_owned(),
            session_id: 0,
            session_version: 0,
            unicast_address: "127.0.0.1".to_owned(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} IN IP4 {}",
            self.username, self.session_id, self.session_version, self.unicast_address
        )
    }
}

/// A decoded session description: the SDP dialect RTSP exchanges in
/// DESCRIBE responses and ANNOUNCE requests (RFC 4566, RFC 2326 §C).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionDescription {
    pub origin: Origin,
    /// The `s=` session name; `None` encodes as `-`.
    pub title: Option<String>,
    /// Session-level `a=control:` (the aggregate control URI).
    pub control: Option<String>,
    /// Session-level `c=` address.
    pub connection: Option<IpAddr>,
    /// Session-level `a=key-mgmt:mikey` blob.
    pub key_mgmt: Option<Vec<u8>>,
    pub medias: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Parses the minimal SDP dialect. Required lines: `v=`, `o=`, `s=`,
    /// `t=`, and at least one `m=`.
    pub fn parse(s: &str) -> Result<SessionDescription> {
        let mut desc = SessionDescription::default();
        let mut seen_v = false;
        let mut seen_o = false;
        let mut seen_s = false;
        let mut seen_t = false;
        let mut current: Option<MediaDescription> = None;

        for raw_line in s.lines() {
            let line = raw_line.trim_end();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidSdp(format!("line without '=': {line}")))?;

            match key {
                "v" => {
                    if value != "0" {
                        return Err(Error::InvalidSdp(format!("unsupported version {value}")));
                    }
                    seen_v = true;
                }
                "o" => {
                    desc.origin = parse_origin(value)?;
                    seen_o = true;
                }
                "s" => {
                    if value != "-" && !value.is_empty() {
                        desc.title = Some(value.to_owned());
                    }
                    seen_s = true;
                }
                "t" => {
                    seen_t = true;
                }
                "c" => {
                    let addr = parse_connection(value)?;
                    if current.is_none() {
                        desc.connection = Some(addr);
                    }
                }
                "m" => {
                    if let Some(media) = current.take() {
                        media.validate()?;
                        desc.medias.push(media);
                    }
                    current = Some(parse_media_line(value)?);
                }
                "a" => {
                    let (name, attr_value) = match value.split_once(':') {
                        Some((n, v)) => (n, Some(v)),
                        None => (value, None),
                    };
                    match &mut current {
                        Some(media) => parse_media_attribute(media, name, attr_value)?,
                        None => parse_session_attribute(&mut desc, name, attr_value)?,
                    }
                }
                // b=, i=, u=, e=, p=, z=, k=, r= are tolerated and ignored
                _ => {}
            }
        }

        if let Some(media) = current.take() {
            media.validate()?;
            desc.medias.push(media);
        }

        if !(seen_v && seen_o && seen_s && seen_t) {
            return Err(Error::InvalidSdp(
                "missing one of the required v=/o=/s=/t= lines".to_owned(),
            ));
        }
        if desc.medias.is_empty() {
            return Err(Error::InvalidSdp("no m= line".to_owned()));
        }

        Ok(desc)
    }

    /// Serializes back into SDP text with CRLF line endings.
    pub fn marshal(&self) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str(&format!("o={}\r\n", self.origin));
        match &self.title {
            Some(t) => out.push_str(&format!("s={t}\r\n")),
            None => out.push_str("s=-\r\n"),
        }
        if let Some(c) = &self.connection {
            out.push_str(&format!("c=IN IP4 {c}\r\n"));
        }
        out.push_str("t=0 0\r\n");
        if let Some(control) = &self.control {
            out.push_str(&format!("a=control:{control}\r\n"));
        }
        if let Some(km) = &self.key_mgmt {
            out.push_str(&format!("a=key-mgmt:mikey {}\r\n", BASE64.encode(km)));
        }

        for media in &self.medias {
            let fmts: Vec<String> = media
                .formats
                .iter()
                .map(|f| f.payload_type.to_string())
                .collect();
            out.push_str(&format!(
                "m={} 0 {} {}\r\n",
                media.media_type,
                media.profile,
                fmts.join(" ")
            ));
            if let Some(control) = &media.control {
                out.push_str(&format!("a=control:{control}\r\n"));
            }
            if let Some(dir) = media.direction {
                out.push_str(&format!("a={dir}\r\n"));
            }
            if let Some(km) = &media.key_mgmt {
                out.push_str(&format!("a=key-mgmt:mikey {}\r\n", BASE64.encode(km)));
            }
            for f in &media.formats {
                if let Some(rtpmap) = f.rtpmap() {
                    out.push_str(&format!("a=rtpmap:{rtpmap}\r\n"));
                }
                if let Some(params) = &f.parameters {
                    out.push_str(&format!("a=fmtp:{} {}\r\n", f.payload_type, params));
                }
            }
        }

        out
    }

    /// Fills in missing per-media control tokens (`trackID=<index>`) and
    /// checks the description invariants: unique non-empty control tokens
    /// and key management present for every SAVP media.
    pub fn prepare(&mut self) -> Result<()> {
        let session_key_mgmt = self.key_mgmt.is_some();

        for i in 0..self.medias.len() {
            let needs_token = match &self.medias[i].control {
                Some(c) => c.is_empty(),
                None => true,
            };
            if needs_token {
                self.medias[i].control = Some(format!("trackID={i}"));
            }
        }

        for (i, media) in self.medias.iter().enumerate() {
            let token = media.control.as_deref().unwrap_or("");
            if token.is_empty() {
                return Err(Error::MissingControl(i));
            }
            if self.medias[..i]
                .iter()
                .any(|m| m.control.as_deref() == Some(token))
            {
                return Err(Error::DuplicateControl(token.to_owned()));
            }
            if media.profile == TransportProfile::Savp
                && media.key_mgmt.is_none()
                && !session_key_mgmt
            {
                return Err(Error::MissingKeyMgmt);
            }
        }

        Ok(())
    }

    /// Index of the media whose control token matches the tail of
    /// `control_url`, in either `trackID=n` or `?trackID=n` form.
    pub fn find_media_by_control(&self, control_url: &str) -> Option<usize> {
        self.medias.iter().position(|m| {
            m.control
                .as_deref()
                .map(|token| {
                    control_url == token
                        || control_url.ends_with(&format!("/{token}"))
                        || control_url.ends_with(&format!("?{token}"))
                })
                .unwrap_or(false)
        })
    }
}

fn parse_origin(value: &str) -> Result<Origin> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 6 {
        return Err(Error::InvalidSdp(format!("bad o= line: {value}")));
    }
    Ok(Origin {
        username: fields[0].to_owned(),
        session_id: fields[1]
            .parse()
            .map_err(|_| Error::InvalidSdp(format!("bad session id {}", fields[1])))?,
        session_version: fields[2]
            .parse()
            .map_err(|_| Error::InvalidSdp(format!("bad session version {}", fields[2])))?,
        unicast_address: fields[5].to_owned(),
    })
}

fn parse_connection(value: &str) -> Result<IpAddr> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 3 || fields[0] != "IN" {
        return Err(Error::InvalidSdp(format!("bad c= line: {value}")));
    }
    // multicast connection addresses may carry /ttl or /ttl/count suffixes
    let addr = fields[2].split('/').next().unwrap_or(fields[2]);
    addr.parse()
        .map_err(|_| Error::InvalidSdp(format!("bad connection address {addr}")))
}

fn parse_media_line(value: &str) -> Result<MediaDescription> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() < 4 {
        return Err(Error::InvalidSdp(format!("bad m= line: {value}")));
    }

    let media_type: MediaType = fields[0].parse()?;
    let profile: TransportProfile = fields[2].parse()?;

    let mut formats = Vec::new();
    for fmt in &fields[3..] {
        let pt: u8 = fmt
            .parse()
            .map_err(|_| Error::InvalidSdp(format!("bad payload type {fmt}")))?;
        if pt > 127 {
            return Err(Error::InvalidSdp(format!("payload type {pt} out of range")));
        }
        let format = Format::from_static_payload_type(pt).unwrap_or(Format {
            payload_type: pt,
            ..Default::default()
        });
        formats.push(format);
    }

    Ok(MediaDescription {
        media_type,
        profile,
        formats,
        control: None,
        direction: None,
        key_mgmt: None,
    })
}

fn parse_session_attribute(
    desc: &mut SessionDescription,
    name: &str,
    value: Option<&str>,
) -> Result<()> {
    match (name, value) {
        ("control", Some(v)) => desc.control = Some(v.to_owned()),
        ("key-mgmt", Some(v)) => desc.key_mgmt = Some(parse_key_mgmt(v)?),
        _ => {}
    }
    Ok(())
}

fn parse_media_attribute(
    media: &mut MediaDescription,
    name: &str,
    value: Option<&str>,
) -> Result<()> {
    match (name, value) {
        ("control", Some(v)) => media.control = Some(v.to_owned()),
        ("key-mgmt", Some(v)) => media.key_mgmt = Some(parse_key_mgmt(v)?),
        ("sendonly", _) => media.direction = Some(Direction::SendOnly),
        ("recvonly", _) => media.direction = Some(Direction::RecvOnly),
        ("rtpmap", Some(v)) => parse_rtpmap(media, v)?,
        ("fmtp", Some(v)) => parse_fmtp(media, v)?,
        _ => {}
    }
    Ok(())
}

fn parse_key_mgmt(value: &str) -> Result<Vec<u8>> {
    let (proto, blob) = value
        .split_once(' ')
        .ok_or_else(|| Error::InvalidSdp(format!("bad key-mgmt: {value}")))?;
    if proto != "mikey" {
        return Err(Error::InvalidSdp(format!(
            "unsupported key-mgmt protocol {proto}"
        )));
    }
    BASE64
        .decode(blob.trim())
        .map_err(|e| Error::InvalidSdp(format!("bad key-mgmt base64: {e}")))
}

fn parse_rtpmap(media: &mut MediaDescription, value: &str) -> Result<()> {
    // "96 H264/90000" or "97 MPEG4-GENERIC/48000/2"
    let (pt_str, map) = value
        .split_once(' ')
        .ok_or_else(|| Error::InvalidSdp(format!("bad rtpmap: {value}")))?;
    let pt: u8 = pt_str
        .parse()
        .map_err(|_| Error::InvalidSdp(format!("bad rtpmap payload type: {pt_str}")))?;

    let mut parts = map.split('/');
    let name = parts
        .next()
        .ok_or_else(|| Error::InvalidSdp(format!("bad rtpmap: {value}")))?;
    let clock_rate: u32 = parts
        .next()
        .ok_or_else(|| Error::InvalidSdp(format!("rtpmap without clock rate: {value}")))?
        .parse()
        .map_err(|_| Error::InvalidSdp(format!("bad rtpmap clock rate: {value}")))?;
    let channels: Option<u8> = match parts.next() {
        Some(ch) => Some(
            ch.parse()
                .map_err(|_| Error::InvalidSdp(format!("bad rtpmap channels: {value}")))?,
        ),
        None => None,
    };

    if let Some(format) = media.formats.iter_mut().find(|f| f.payload_type == pt) {
        format.encoding_name = name.to_owned();
        format.clock_rate = clock_rate;
        format.channels = channels;
    }
    Ok(())
}

fn parse_fmtp(media: &mut MediaDescription, value: &str) -> Result<()> {
    let (pt_str, params) = value
        .split_once(' ')
        .ok_or_else(|| Error::InvalidSdp(format!("bad fmtp: {value}")))?;
    let pt: u8 = pt_str
        .parse()
        .map_err(|_| Error::InvalidSdp(format!("bad fmtp payload type: {pt_str}")))?;

    if let Some(format) = media.formats.iter_mut().find(|f| f.payload_type == pt) {
        format.parameters = Some(params.to_owned());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const H264_SDP: &str = "v=0\r\n\
        o=- 0 0 IN IP4 127.0.0.1\r\n\
        s=Stream\r\n\
        c=IN IP4 0.0.0.0\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=control:trackID=0\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1; sprop-parameter-sets=Z2QAFqzZQPARabIAAAMACAAAAwGUeMGVA==,aOvssiw=\r\n";

    #[test]
    fn test_parse_h264() {
        let desc = SessionDescription::parse(H264_SDP).unwrap();
        assert_eq!(desc.title.as_deref(), Some("Stream"));
        assert_eq!(desc.control.as_deref(), Some("*"));
        assert_eq!(desc.medias.len(), 1);

        let media = &desc.medias[0];
        assert_eq!(media.media_type, MediaType::Video);
        assert_eq!(media.profile, TransportProfile::Avp);
        assert_eq!(media.control.as_deref(), Some("trackID=0"));

        let f = &media.formats[0];
        assert_eq!(f.payload_type, 96);
        assert_eq!(f.encoding_name, "H264");
        assert_eq!(f.clock_rate, 90000);
        assert!(f.parameters.as_deref().unwrap().contains("sprop-parameter-sets"));
    }

    #[test]
    fn test_round_trip() {
        let desc = SessionDescription::parse(H264_SDP).unwrap();
        let reparsed = SessionDescription::parse(&desc.marshal()).unwrap();
        assert_eq!(reparsed, desc);
    }

    #[test]
    fn test_missing_required_line() {
        let sdp = "v=0\r\ns=x\r\nt=0 0\r\nm=video 0 RTP/AVP 96\r\n";
        assert!(SessionDescription::parse(sdp).is_err());
    }

    #[test]
    fn test_prepare_assigns_tokens() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n\
                   m=audio 0 RTP/AVP 0\r\n";
        let mut desc = SessionDescription::parse(sdp).unwrap();
        desc.prepare().unwrap();
        assert_eq!(desc.medias[0].control.as_deref(), Some("trackID=0"));
        assert_eq!(desc.medias[1].control.as_deref(), Some("trackID=1"));
    }

    #[test]
    fn test_prepare_rejects_duplicate_tokens() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=video 0 RTP/AVP 96\r\na=control:trackID=7\r\n\
                   m=audio 0 RTP/AVP 0\r\na=control:trackID=7\r\n";
        let mut desc = SessionDescription::parse(sdp).unwrap();
        assert_eq!(
            desc.prepare(),
            Err(Error::DuplicateControl("trackID=7".to_owned()))
        );
    }

    #[test]
    fn test_savp_requires_key_mgmt() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=video 0 RTP/SAVP 96\r\na=rtpmap:96 H264/90000\r\n";
        let mut desc = SessionDescription::parse(sdp).unwrap();
        assert_eq!(desc.prepare(), Err(Error::MissingKeyMgmt));
    }

    #[test]
    fn test_key_mgmt_round_trip() {
        let mut desc = SessionDescription::parse(H264_SDP).unwrap();
        desc.medias[0].profile = TransportProfile::Savp;
        desc.medias[0].key_mgmt = Some(vec![1, 2, 3, 4, 5]);
        let reparsed = SessionDescription::parse(&desc.marshal()).unwrap();
        assert_eq!(reparsed.medias[0].key_mgmt.as_deref(), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn test_static_payload_type_fallback() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=audio 0 RTP/AVP 0\r\n";
        let desc = SessionDescription::parse(sdp).unwrap();
        let f = &desc.medias[0].formats[0];
        assert_eq!(f.encoding_name, "PCMU");
        assert_eq!(f.clock_rate, 8000);
    }

    #[test]
    fn test_find_media_by_control() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
                   m=video 0 RTP/AVP 96\r\na=control:trackID=0\r\n\
                   m=audio 0 RTP/AVP 0\r\na=control:trackID=1\r\n";
        let desc = SessionDescription::parse(sdp).unwrap();
        assert_eq!(
            desc.find_media_by_control("rtsp://h/stream/trackID=1"),
            Some(1)
        );
        assert_eq!(desc.find_media_by_control("rtsp://h/stream?trackID=0"), Some(0));
        assert_eq!(desc.find_media_by_control("rtsp://h/stream/trackID=9"), None);
    }
}

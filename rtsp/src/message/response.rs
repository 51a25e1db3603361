use bytes::{BufMut, Bytes, BytesMut};

use shared::error::{Error, Result};

use crate::message::{HeaderMap, RTSP_VERSION, StatusCode};

/// An RTSP response, correlated to its request by the echoed CSeq.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Response {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self.headers.set("Content-Type", content_type);
        self
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(format!("{RTSP_VERSION} {}\r\n", self.status).as_bytes());
        for (name, value) in self.headers.iter() {
            buf.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() {
            buf.put_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub(crate) fn parse_head(lines: &[String]) -> Result<Response> {
        let status_line = lines
            .first()
            .ok_or_else(|| Error::Malformed("empty response".to_owned()))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts
            .next()
            .ok_or_else(|| Error::Malformed("empty status line".to_owned()))?;
        if version != RTSP_VERSION {
            return Err(Error::Malformed(format!("bad version: {version}")));
        }
        let code: u16 = parts
            .next()
            .ok_or_else(|| Error::Malformed("status line without code".to_owned()))?
            .parse()
            .map_err(|_| Error::Malformed(format!("bad status line: {status_line}")))?;

        let mut headers = HeaderMap::new();
        for line in &lines[1..] {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Malformed(format!("bad header line: {line}")))?;
            headers.add(name.trim(), value.trim().to_owned());
        }

        Ok(Response {
            status: StatusCode(code),
            headers,
            body: Bytes::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal() {
        let res = Response::new(StatusCode::OK).with_header("CSeq", "1");
        let raw = String::from_utf8(res.marshal().to_vec()).unwrap();
        assert_eq!(raw, "RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n");
    }

    #[test]
    fn test_parse_head() {
        let lines = vec![
            "RTSP/1.0 461 Unsupported Transport".to_owned(),
            "CSeq: 4".to_owned(),
        ];
        let res = Response::parse_head(&lines).unwrap();
        assert_eq!(res.status, StatusCode::UNSUPPORTED_TRANSPORT);
        assert_eq!(res.headers.get("CSeq"), Some("4"));
    }
}

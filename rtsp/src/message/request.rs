use bytes::{BufMut, Bytes, BytesMut};

use shared::error::{Error, Result};

use crate::message::{HeaderMap, Method, RTSP_VERSION};

/// An RTSP request: method, request URI, headers, optional body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Request {
            method,
            url: url.into(),
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

    pub fn cseq(&self) -> Result<u32> {
        let raw = self.headers.get("CSeq").ok_or(Error::MissingCseq)?;
        raw.trim()
            .parse()
            .map_err(|_| Error::MalformedHeader("CSeq".to_owned(), raw.to_owned()))
    }

    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256 + self.body.len());
        buf.put_slice(format!("{} {} {RTSP_VERSION}\r\n", self.method, self.url).as_bytes());
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

    /// Parses the request line and header block (everything before the body).
    pub(crate) fn parse_head(lines: &[String]) -> Result<Request> {
        let request_line = lines
            .first()
            .ok_or_else(|| Error::Malformed("empty request".to_owned()))?;
        let mut parts = request_line.split_ascii_whitespace();
        let (method, url, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(u), Some(v), None) => (m, u, v),
            _ => {
                return Err(Error::Malformed(format!(
                    "bad request line: {request_line}"
                )));
            }
        };
        if version != RTSP_VERSION {
            return Err(Error::Malformed(format!("bad version: {version}")));
        }

        let mut headers = HeaderMap::new();
        for line in &lines[1..] {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::Malformed(format!("bad header line: {line}")))?;
            headers.add(name.trim(), value.trim().to_owned());
        }

        Ok(Request {
            method: method.parse()?,
            url: url.to_owned(),
            headers,
            body: Bytes::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_with_body() {
        let req = Request::new(Method::Announce, "rtsp://h/stream")
            .with_header("CSeq", "2")
            .with_body("application/sdp", "v=0\r\n");
        let raw = String::from_utf8(req.marshal().to_vec()).unwrap();
        assert!(raw.starts_with("ANNOUNCE rtsp://h/stream RTSP/1.0\r\n"));
        assert!(raw.contains("Content-Length: 5\r\n"));
        assert!(raw.ends_with("\r\n\r\nv=0\r\n"));
    }

    #[test]
    fn test_cseq_missing() {
        let req = Request::new(Method::Options, "rtsp://h/");
        assert_eq!(req.cseq(), Err(Error::MissingCseq));
    }
}

use bytes::{Buf, BytesMut};

use shared::error::{Error, Result};

use crate::message::interleaved::{FRAME_HEADER_LEN, FRAME_MAGIC, Frame};
use crate::message::{MAX_BODY_LEN, MAX_HEAD_LEN, Request, Response};

/// One unit read off the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Request(Request),
    Response(Response),
    Frame(Frame),
}

/// Incremental decoder for the RTSP control connection. Feed it raw bytes
/// in any chunk size; it yields complete requests, responses, and
/// interleaved frames, dispatching on the first byte (`$` versus ASCII).
#[derive(Debug)]
pub struct MessageDecoder {
    buf: BytesMut,
    max_frame_len: usize,
}

impl MessageDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_frame_len,
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Attempts to extract the next complete item. `Ok(None)` means more
    /// data is needed; any `Err` is fatal for the connection.
    pub fn next(&mut self) -> Result<Option<Item>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] == FRAME_MAGIC {
            self.next_frame()
        } else {
            self.next_message()
        }
    }

    fn next_frame(&mut self) -> Result<Option<Item>> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let length = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if length > self.max_frame_len {
            return Err(Error::FrameTooLarge(length, self.max_frame_len));
        }
        if self.buf.len() < FRAME_HEADER_LEN + length {
            return Ok(None);
        }

        let channel = self.buf[1];
        self.buf.advance(FRAME_HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        Ok(Some(Item::Frame(Frame { channel, payload })))
    }

    fn next_message(&mut self) -> Result<Option<Item>> {
        let head_end = match find_head_end(&self.buf) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > MAX_HEAD_LEN {
                    return Err(Error::Malformed("header block too large".to_owned()));
                }
                return Ok(None);
            }
        };

        let head = std::str::from_utf8(&self.buf[..head_end])
            .map_err(|_| Error::Malformed("non-ASCII header block".to_owned()))?;
        let lines = unfold_lines(head);
        let is_response = lines
            .first()
            .map(|l| l.starts_with("RTSP/"))
            .unwrap_or(false);

        let (content_length, item) = if is_response {
            let res = Response::parse_head(&lines)?;
            (parse_content_length(res.headers.get("Content-Length"))?, Item::Response(res))
        } else {
            let req = Request::parse_head(&lines)?;
            (parse_content_length(req.headers.get("Content-Length"))?, Item::Request(req))
        };

        if content_length > MAX_BODY_LEN {
            return Err(Error::BodyTooLarge(content_length, MAX_BODY_LEN));
        }
        let total = head_end + 4 + content_length;
        if self.buf.len() < total {
            return Ok(None);
        }

        self.buf.advance(head_end + 4);
        let body = self.buf.split_to(content_length).freeze();

        Ok(Some(match item {
            Item::Request(mut req) => {
                req.body = body;
                Item::Request(req)
            }
            Item::Response(mut res) => {
                res.body = body;
                Item::Response(res)
            }
            frame => frame,
        }))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_content_length(raw: Option<&str>) -> Result<usize> {
    match raw {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| Error::MalformedHeader("Content-Length".to_owned(), v.to_owned())),
        None => Ok(0),
    }
}

/// Splits the header block into logical lines, joining LWS continuation
/// lines (RFC 2326 §4.2) onto their predecessor.
fn unfold_lines(head: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in head.split("\r\n") {
        if raw.starts_with(' ') || raw.starts_with('\t') {
            if let Some(last) = lines.last_mut() {
                last.push(' ');
                last.push_str(raw.trim());
                continue;
            }
        }
        lines.push(raw.to_owned());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Method, StatusCode};

    #[test]
    fn test_request_in_chunks() {
        let raw = b"OPTIONS rtsp://localhost:8554/stream RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let mut d = MessageDecoder::new(1472);

        d.extend_from_slice(&raw[..10]);
        assert_eq!(d.next().unwrap(), None);

        d.extend_from_slice(&raw[10..]);
        match d.next().unwrap().unwrap() {
            Item::Request(req) => {
                assert_eq!(req.method, Method::Options);
                assert_eq!(req.url, "rtsp://localhost:8554/stream");
                assert_eq!(req.headers.get("CSeq"), Some("1"));
            }
            other => panic!("unexpected item {other:?}"),
        }
        assert_eq!(d.next().unwrap(), None);
    }

    #[test]
    fn test_response_with_body() {
        let raw = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 4\r\n\r\nv=0\n";
        let mut d = MessageDecoder::new(1472);
        d.extend_from_slice(raw);
        match d.next().unwrap().unwrap() {
            Item::Response(res) => {
                assert_eq!(res.status, StatusCode::OK);
                assert_eq!(res.body.as_ref(), b"v=0\n");
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_body_waits_for_completion() {
        let raw = b"RTSP/1.0 200 OK\r\nContent-Length: 4\r\n\r\nv=";
        let mut d = MessageDecoder::new(1472);
        d.extend_from_slice(raw);
        assert_eq!(d.next().unwrap(), None);
        d.extend_from_slice(b"0\n");
        assert!(matches!(d.next().unwrap(), Some(Item::Response(_))));
    }

    #[test]
    fn test_frame_then_message() {
        let mut d = MessageDecoder::new(1472);
        d.extend_from_slice(&[0x24, 0x00, 0x00, 0x02, 0xAA, 0xBB]);
        d.extend_from_slice(b"RTSP/1.0 200 OK\r\n\r\n");

        match d.next().unwrap().unwrap() {
            Item::Frame(f) => {
                assert_eq!(f.channel, 0);
                assert_eq!(f.payload.as_ref(), &[0xAA, 0xBB]);
            }
            other => panic!("unexpected item {other:?}"),
        }
        assert!(matches!(d.next().unwrap(), Some(Item::Response(_))));
    }

    #[test]
    fn test_frame_over_ceiling() {
        let mut d = MessageDecoder::new(16);
        d.extend_from_slice(&[0x24, 0x00, 0x00, 0x11]);
        assert_eq!(d.next(), Err(Error::FrameTooLarge(17, 16)));
    }

    #[test]
    fn test_folded_header() {
        let raw = b"DESCRIBE rtsp://h/s RTSP/1.0\r\nCSeq: 1\r\nX-Long: first\r\n second\r\n\r\n";
        let mut d = MessageDecoder::new(1472);
        d.extend_from_slice(raw);
        match d.next().unwrap().unwrap() {
            Item::Request(req) => {
                assert_eq!(req.headers.get("X-Long"), Some("first second"));
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[test]
    fn test_bad_content_length() {
        let raw = b"RTSP/1.0 200 OK\r\nContent-Length: x\r\n\r\n";
        let mut d = MessageDecoder::new(1472);
        d.extend_from_slice(raw);
        assert!(d.next().is_err());
    }

    #[test]
    fn test_round_trip_law() {
        // parse(serialize(parse(M))) == parse(M)
        let raw = b"SETUP rtsp://h/s/trackID=0 RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=8000-8001\r\n\r\n";
        let mut d = MessageDecoder::new(1472);
        d.extend_from_slice(raw);
        let first = match d.next().unwrap().unwrap() {
            Item::Request(r) => r,
            other => panic!("unexpected item {other:?}"),
        };

        let mut d2 = MessageDecoder::new(1472);
        d2.extend_from_slice(&first.marshal());
        let second = match d2.next().unwrap().unwrap() {
            Item::Request(r) => r,
            other => panic!("unexpected item {other:?}"),
        };
        assert_eq!(first, second);
    }
}

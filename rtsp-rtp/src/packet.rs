use std::fmt;

use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::Header;

/// An RTP packet: parsed header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "RTP PACKET:")?;
        writeln!(f, "\tPayloadType: {}", self.header.payload_type)?;
        writeln!(f, "\tSequenceNumber: {}", self.header.sequence_number)?;
        writeln!(f, "\tTimestamp: {}", self.header.timestamp)?;
        writeln!(f, "\tSSRC: {:#010x}", self.header.ssrc)?;
        writeln!(f, "\tMarker: {}", self.header.marker)?;
        writeln!(f, "\tPayloadLength: {}", self.payload.len())
    }
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < self.marshal_size() {
            return Err(Error::BufferTooShort);
        }
        let n = self.header.marshal_to(buf)?;
        buf[n..n + self.payload.len()].copy_from_slice(&self.payload);
        Ok(n + self.payload.len())
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        let header = Header::unmarshal(buf)?;
        let mut payload = buf.copy_to_bytes(buf.remaining());

        if header.padding {
            if payload.is_empty() {
                return Err(Error::PacketTooShort);
            }
            let pad = payload[payload.len() - 1] as usize;
            if pad == 0 || pad > payload.len() {
                return Err(Error::PacketTooShort);
            }
            payload = payload.slice(..payload.len() - pad);
        }

        Ok(Packet { header, payload })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let p = Packet {
            header: Header {
                payload_type: 96,
                sequence_number: 0,
                ssrc: 0x38F27A2F,
                ..Default::default()
            },
            payload: Bytes::from_static(&[0x05, 0x02, 0x03, 0x04]),
        };
        let raw = p.marshal().unwrap();
        let parsed = Packet::unmarshal(&mut raw.clone()).unwrap();
        assert_eq!(parsed, p);
        assert_eq!(parsed.marshal().unwrap(), raw);
    }

    #[test]
    fn test_padding_stripped() {
        // 12-byte header, payload [1 2], 2 bytes padding (0x00 0x02)
        let mut raw = vec![0xA0, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        raw.extend_from_slice(&[1, 2, 0x00, 0x02]);
        let p = Packet::unmarshal(&mut Bytes::from(raw)).unwrap();
        assert_eq!(p.payload.as_ref(), &[1, 2]);
    }

    #[test]
    fn test_bad_padding() {
        let mut raw = vec![0xA0, 0x60, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 1];
        raw.extend_from_slice(&[0x09]);
        assert_eq!(
            Packet::unmarshal(&mut Bytes::from(raw)),
            Err(Error::PacketTooShort)
        );
    }
}

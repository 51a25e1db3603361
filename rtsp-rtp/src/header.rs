use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 12;
pub const VERSION: u8 = 2;

const VERSION_SHIFT: u8 = 6;
const PADDING_SHIFT: u8 = 5;
const EXTENSION_SHIFT: u8 = 4;
const CC_MASK: u8 = 0x0F;
const MARKER_SHIFT: u8 = 7;
const PT_MASK: u8 = 0x7F;

/// The fixed RTP header plus CSRC list and raw extension (RFC 3550 §5.1).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrcs: Vec<u32>,
    pub extension_profile: u16,
    /// Raw extension words following the profile/length word. Kept opaque;
    /// RTSP only needs to skip past them.
    pub extension_payload: Bytes,
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        let mut n = HEADER_LENGTH + 4 * self.csrcs.len();
        if self.extension {
            n += 4 + self.extension_payload.len();
        }
        n
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let size = self.marshal_size();
        if buf.len() < size {
            return Err(Error::BufferTooShort);
        }
        if self.extension && self.extension_payload.len() % 4 != 0 {
            return Err(Error::Malformed(
                "extension payload not padded to 32 bits".to_owned(),
            ));
        }

        buf[0] = (VERSION << VERSION_SHIFT)
            | ((self.padding as u8) << PADDING_SHIFT)
            | ((self.extension as u8) << EXTENSION_SHIFT)
            | (self.csrcs.len() as u8 & CC_MASK);
        buf[1] = ((self.marker as u8) << MARKER_SHIFT) | (self.payload_type & PT_MASK);
        buf[2..4].copy_from_slice(&self.sequence_number.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        let mut off = HEADER_LENGTH;
        for csrc in &self.csrcs {
            buf[off..off + 4].copy_from_slice(&csrc.to_be_bytes());
            off += 4;
        }

        if self.extension {
            buf[off..off + 2].copy_from_slice(&self.extension_profile.to_be_bytes());
            let words = (self.extension_payload.len() / 4) as u16;
            buf[off + 2..off + 4].copy_from_slice(&words.to_be_bytes());
            off += 4;
            buf[off..off + self.extension_payload.len()].copy_from_slice(&self.extension_payload);
            off += self.extension_payload.len();
        }

        Ok(off)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < HEADER_LENGTH {
            return Err(Error::PacketTooShort);
        }

        let b0 = buf.get_u8();
        if b0 >> VERSION_SHIFT != VERSION {
            return Err(Error::BadVersion);
        }
        let padding = (b0 >> PADDING_SHIFT) & 1 == 1;
        let extension = (b0 >> EXTENSION_SHIFT) & 1 == 1;
        let cc = (b0 & CC_MASK) as usize;

        let b1 = buf.get_u8();
        let marker = b1 >> MARKER_SHIFT == 1;
        let payload_type = b1 & PT_MASK;

        let sequence_number = buf.get_u16();
        let timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        if buf.remaining() < 4 * cc {
            return Err(Error::PacketTooShort);
        }
        let mut csrcs = Vec::with_capacity(cc);
        for _ in 0..cc {
            csrcs.push(buf.get_u32());
        }

        let (extension_profile, extension_payload) = if extension {
            if buf.remaining() < 4 {
                return Err(Error::PacketTooShort);
            }
            let profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return Err(Error::PacketTooShort);
            }
            (profile, buf.copy_to_bytes(words * 4))
        } else {
            (0, Bytes::new())
        };

        Ok(Header {
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrcs,
            extension_profile,
            extension_payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_round_trip() {
        let h = Header {
            marker: true,
            payload_type: 96,
            sequence_number: 27023,
            timestamp: 3653407706,
            ssrc: 476325762,
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(raw.len(), HEADER_LENGTH);
        let parsed = Header::unmarshal(&mut raw.clone()).unwrap();
        assert_eq!(parsed, h);
    }

    #[test]
    fn test_csrcs_round_trip() {
        let h = Header {
            payload_type: 0,
            sequence_number: 1,
            timestamp: 2,
            ssrc: 3,
            csrcs: vec![0x11223344, 0x55667788],
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(raw.len(), HEADER_LENGTH + 8);
        assert_eq!(Header::unmarshal(&mut raw.clone()).unwrap(), h);
    }

    #[test]
    fn test_extension_round_trip() {
        let h = Header {
            extension: true,
            extension_profile: 0xBEDE,
            extension_payload: Bytes::from_static(&[1, 2, 3, 4]),
            payload_type: 96,
            ..Default::default()
        };
        let raw = h.marshal().unwrap();
        assert_eq!(Header::unmarshal(&mut raw.clone()).unwrap(), h);
    }

    #[test]
    fn test_wrong_version() {
        let raw = Bytes::from_static(&[0x00; 12]);
        assert_eq!(Header::unmarshal(&mut raw.clone()), Err(Error::BadVersion));
    }

    #[test]
    fn test_too_short() {
        let raw = Bytes::from_static(&[0x80, 0x60, 0x00]);
        assert_eq!(
            Header::unmarshal(&mut raw.clone()),
            Err(Error::PacketTooShort)
        );
    }
}

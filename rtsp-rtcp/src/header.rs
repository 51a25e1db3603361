use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LENGTH: usize = 4;
pub const VERSION: u8 = 2;
pub const COUNT_MAX: usize = (1 << 5) - 1;
pub const SSRC_LENGTH: usize = 4;

const VERSION_SHIFT: u8 = 6;
const PADDING_SHIFT: u8 = 5;
const COUNT_MASK: u8 = 0x1F;

/// RTCP packet types registered by RFC 3550 §12.1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PacketType {
    #[default]
    Unsupported = 0,
    SenderReport = 200,
    ReceiverReport = 201,
    SourceDescription = 202,
    Goodbye = 203,
    ApplicationDefined = 204,
}

impl From<u8> for PacketType {
    fn from(b: u8) -> Self {
        match b {
            200 => PacketType::SenderReport,
            201 => PacketType::ReceiverReport,
            202 => PacketType::SourceDescription,
            203 => PacketType::Goodbye,
            204 => PacketType::ApplicationDefined,
            _ => PacketType::Unsupported,
        }
    }
}

/// The common four-byte RTCP header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub padding: bool,
    /// Reception-report count or source count, 5 bits.
    pub count: u8,
    pub packet_type: PacketType,
    /// Packet length in 32-bit words minus one.
    pub length: u16,
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::BufferTooShort);
        }
        if self.count as usize > COUNT_MAX {
            return Err(Error::TooManyReports);
        }
        buf[0] = (VERSION << VERSION_SHIFT)
            | ((self.padding as u8) << PADDING_SHIFT)
            | (self.count & COUNT_MASK);
        buf[1] = self.packet_type as u8;
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        Ok(HEADER_LENGTH)
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
        let count = b0 & COUNT_MASK;
        let packet_type = PacketType::from(buf.get_u8());
        let length = buf.get_u16();
        Ok(Header {
            padding,
            count,
            packet_type,
            length,
        })
    }
}

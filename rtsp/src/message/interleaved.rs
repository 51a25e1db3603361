use bytes::{BufMut, Bytes, BytesMut};

use shared::error::{Error, Result};

/// `$ <channel> <length>` prefix length of an interleaved frame.
pub const FRAME_HEADER_LEN: usize = 4;

pub(crate) const FRAME_MAGIC: u8 = 0x24;

/// A binary RTP or RTCP packet carried on the RTSP control connection
/// (RFC 2326 §10.12): `0x24 <channel:u8> <length:u16 BE> <payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn marshal(&self) -> Result<Bytes> {
        if self.payload.len() > u16::MAX as usize {
            return Err(Error::FrameTooLarge(self.payload.len(), u16::MAX as usize));
        }
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(FRAME_MAGIC);
        buf.put_u8(self.channel);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType, SSRC_LENGTH};
use crate::reception_report::ReceptionReport;

pub const SENDER_INFO_LENGTH: usize = 20;

/// A SenderReport (SR) packet: transmission and reception statistics from
/// an active sender (RFC 3550 §6.4.1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SenderReport {
    /// The synchronization source identifier for the originator of this SR packet.
    pub ssrc: u32,
    /// The wallclock time when this report was sent, as a 64-bit NTP timestamp.
    pub ntp_time: u64,
    /// The same instant as `ntp_time`, but in the units and with the random
    /// offset of the RTP timestamps in data packets.
    pub rtp_time: u32,
    /// The total number of RTP data packets transmitted by the sender since
    /// starting transmission, wrapping at 2^32.
    pub packet_count: u32,
    /// The total number of payload octets transmitted in RTP data packets
    /// by the sender since starting transmission, wrapping at 2^32.
    pub octet_count: u32,
    /// Zero or more reception report blocks for sources heard by this sender.
    pub reports: Vec<ReceptionReport>,
}

impl SenderReport {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: PacketType::SenderReport,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }
}

impl MarshalSize for SenderReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
            + SSRC_LENGTH
            + SENDER_INFO_LENGTH
            + self.reports.len() * ReceptionReport::default().marshal_size()
    }
}

impl Marshal for SenderReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if self.reports.len() > COUNT_MAX {
            return Err(Error::TooManyReports);
        }
        if buf.len() < self.marshal_size() {
            return Err(Error::BufferTooShort);
        }

        let mut off = self.header().marshal_to(buf)?;
        buf[off..off + 4].copy_from_slice(&self.ssrc.to_be_bytes());
        off += 4;
        buf[off..off + 8].copy_from_slice(&self.ntp_time.to_be_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.rtp_time.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.packet_count.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.octet_count.to_be_bytes());
        off += 4;
        for rep in &self.reports {
            off += rep.marshal_to(&mut buf[off..])?;
        }
        Ok(off)
    }
}

impl Unmarshal for SenderReport {
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        let header = Header::unmarshal(buf)?;
        if header.packet_type != PacketType::SenderReport {
            return Err(Error::WrongType);
        }
        if buf.remaining() < SSRC_LENGTH + SENDER_INFO_LENGTH {
            return Err(Error::PacketTooShort);
        }

        let ssrc = buf.get_u32();
        let ntp_time = buf.get_u64();
        let rtp_time = buf.get_u32();
        let packet_count = buf.get_u32();
        let octet_count = buf.get_u32();

        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(buf)?);
        }

        Ok(SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count,
            octet_count,
            reports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let sr = SenderReport {
            ssrc: 753621,
            ntp_time: 0xDD31_FD2A_0000_0000,
            rtp_time: 54352,
            packet_count: 1,
            octet_count: 4,
            reports: vec![ReceptionReport {
                ssrc: 902880,
                fraction_lost: 0,
                total_lost: 0,
                last_sequence_number: 946,
                jitter: 0,
                last_sender_report: 0,
                delay: 0,
            }],
        };
        let raw = sr.marshal().unwrap();
        assert_eq!(raw.len(), 28 + 24);
        let parsed = SenderReport::unmarshal(&mut raw.clone()).unwrap();
        assert_eq!(parsed, sr);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let rr = crate::receiver_report::ReceiverReport::default();
        let raw = rr.marshal().unwrap();
        assert_eq!(
            SenderReport::unmarshal(&mut raw.clone()),
            Err(Error::WrongType)
        );
    }
}

use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{COUNT_MAX, HEADER_LENGTH, Header, PacketType, SSRC_LENGTH};
use crate::reception_report::ReceptionReport;

/// A ReceiverReport (RR) packet: reception statistics from a participant
/// that is not an active sender (RFC 3550 §6.4.2).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiverReport {
    /// The synchronization source identifier for the originator of this RR packet.
    pub ssrc: u32,
    /// One reception report block per source heard since the last report.
    pub reports: Vec<ReceptionReport>,
}

impl ReceiverReport {
    pub fn header(&self) -> Header {
        Header {
            padding: false,
            count: self.reports.len() as u8,
            packet_type: PacketType::ReceiverReport,
            length: ((self.marshal_size() / 4) - 1) as u16,
        }
    }
}

impl MarshalSize for ReceiverReport {
    fn marshal_size(&self) -> usize {
        HEADER_LENGTH
            + SSRC_LENGTH
            + self.reports.len() * ReceptionReport::default().marshal_size()
    }
}

impl Marshal for ReceiverReport {
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
        for rep in &self.reports {
            off += rep.marshal_to(&mut buf[off..])?;
        }
        Ok(off)
    }
}

impl Unmarshal for ReceiverReport {
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        let header = Header::unmarshal(buf)?;
        if header.packet_type != PacketType::ReceiverReport {
            return Err(Error::WrongType);
        }
        if buf.remaining() < SSRC_LENGTH {
            return Err(Error::PacketTooShort);
        }

        let ssrc = buf.get_u32();
        let mut reports = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
            reports.push(ReceptionReport::unmarshal(buf)?);
        }

        Ok(ReceiverReport { ssrc, reports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let rr = ReceiverReport {
            ssrc: 0x902f9e2e,
            reports: vec![ReceptionReport {
                ssrc: 0xbc5e9a40,
                fraction_lost: 0,
                total_lost: 0,
                last_sequence_number: 0x46e1,
                jitter: 273,
                last_sender_report: 0x9f36432,
                delay: 150137,
            }],
        };
        let raw = rr.marshal().unwrap();
        assert_eq!(raw.len(), 8 + 24);
        assert_eq!(ReceiverReport::unmarshal(&mut raw.clone()).unwrap(), rr);
    }

    #[test]
    fn test_empty_report() {
        let rr = ReceiverReport {
            ssrc: 1,
            reports: vec![],
        };
        let raw = rr.marshal().unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(ReceiverReport::unmarshal(&mut raw.clone()).unwrap(), rr);
    }
}

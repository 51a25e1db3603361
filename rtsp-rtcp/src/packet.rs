use bytes::{Buf, Bytes};

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

use crate::header::{HEADER_LENGTH, Header, PacketType};
use crate::receiver_report::ReceiverReport;
use crate::sender_report::SenderReport;

/// One packet out of a (possibly compound) RTCP datagram.
///
/// Packet types the library does not act on are preserved as raw bytes so a
/// caller can still forward or inspect them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    Other { header: Header, raw: Bytes },
}

impl RtcpPacket {
    /// Splits a compound RTCP datagram into its constituent packets.
    pub fn unmarshal_compound(buf: &[u8]) -> Result<Vec<RtcpPacket>> {
        let mut out = Vec::new();
        let mut rest = Bytes::copy_from_slice(buf);

        while !rest.is_empty() {
            if rest.len() < HEADER_LENGTH {
                return Err(Error::PacketTooShort);
            }
            let header = Header::unmarshal(&mut rest.clone())?;
            let total = HEADER_LENGTH + header.length as usize * 4;
            if rest.len() < total {
                return Err(Error::PacketTooShort);
            }
            let mut one = rest.slice(..total);
            rest = rest.slice(total..);

            match header.packet_type {
                PacketType::SenderReport => {
                    out.push(RtcpPacket::SenderReport(SenderReport::unmarshal(&mut one)?));
                }
                PacketType::ReceiverReport => {
                    out.push(RtcpPacket::ReceiverReport(ReceiverReport::unmarshal(
                        &mut one,
                    )?));
                }
                _ => {
                    one.advance(HEADER_LENGTH);
                    out.push(RtcpPacket::Other { header, raw: one });
                }
            }
        }

        if out.is_empty() {
            return Err(Error::PacketTooShort);
        }
        Ok(out)
    }

    pub fn marshal(&self) -> Result<Bytes> {
        match self {
            RtcpPacket::SenderReport(sr) => sr.marshal(),
            RtcpPacket::ReceiverReport(rr) => rr.marshal(),
            RtcpPacket::Other { header, raw } => {
                let mut buf = vec![0u8; HEADER_LENGTH + raw.len()];
                header.marshal_to(&mut buf)?;
                buf[HEADER_LENGTH..].copy_from_slice(raw);
                Ok(Bytes::from(buf))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compound_sr_then_rr() {
        let sr = SenderReport {
            ssrc: 1,
            ntp_time: 2,
            rtp_time: 3,
            packet_count: 4,
            octet_count: 5,
            reports: vec![],
        };
        let rr = ReceiverReport {
            ssrc: 6,
            reports: vec![],
        };
        let mut raw = sr.marshal().unwrap().to_vec();
        raw.extend_from_slice(&rr.marshal().unwrap());

        let packets = RtcpPacket::unmarshal_compound(&raw).unwrap();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0], RtcpPacket::SenderReport(sr));
        assert_eq!(packets[1], RtcpPacket::ReceiverReport(rr));
    }

    #[test]
    fn test_unknown_type_preserved() {
        // SDES header with zero chunks
        let raw = [0x80u8, 202, 0x00, 0x00];
        let packets = RtcpPacket::unmarshal_compound(&raw).unwrap();
        match &packets[0] {
            RtcpPacket::Other { header, raw } => {
                assert_eq!(header.packet_type, PacketType::SourceDescription);
                assert!(raw.is_empty());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_truncated_compound() {
        let sr = SenderReport::default();
        let raw = sr.marshal().unwrap();
        assert_eq!(
            RtcpPacket::unmarshal_compound(&raw[..raw.len() - 1]),
            Err(Error::PacketTooShort)
        );
    }
}

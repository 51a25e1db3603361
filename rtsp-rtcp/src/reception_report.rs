use bytes::Buf;

use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const RECEPTION_REPORT_LENGTH: usize = 24;
const FRACTION_LOST_OFFSET: usize = 4;
const TOTAL_LOST_OFFSET: usize = 5;
const LAST_SEQ_OFFSET: usize = 8;
const JITTER_OFFSET: usize = 12;
const LAST_SR_OFFSET: usize = 16;
const DELAY_OFFSET: usize = 20;

/// A reception report block: statistics on the reception of RTP packets
/// from a single synchronization source (RFC 3550 §6.4.1).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ReceptionReport {
    /// The SSRC identifier of the source to which the information in this
    /// reception report block pertains.
    pub ssrc: u32,
    /// The fraction of RTP data packets from source lost since the previous
    /// report was sent, expressed as a fixed point number with the binary
    /// point at the left edge of the field.
    pub fraction_lost: u8,
    /// The total number of RTP data packets from source that have been lost
    /// since the beginning of reception, 24 bits.
    pub total_lost: u32,
    /// The low 16 bits contain the highest sequence number received in an
    /// RTP data packet from source, and the most significant 16 bits extend
    /// that sequence number with the corresponding count of cycles.
    pub last_sequence_number: u32,
    /// An estimate of the statistical variance of the RTP data packet
    /// interarrival time, measured in timestamp units.
    pub jitter: u32,
    /// The middle 32 bits out of 64 in the NTP timestamp of the most recent
    /// sender report. If no SR has been received yet, the field is zero.
    pub last_sender_report: u32,
    /// The delay between receiving the last SR packet and sending this
    /// reception report block, in units of 1/65536 seconds.
    pub delay: u32,
}

impl MarshalSize for ReceptionReport {
    fn marshal_size(&self) -> usize {
        RECEPTION_REPORT_LENGTH
    }
}

impl Marshal for ReceptionReport {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < RECEPTION_REPORT_LENGTH {
            return Err(Error::BufferTooShort);
        }
        if self.total_lost >= (1 << 24) {
            return Err(Error::InvalidTotalLost);
        }

        buf[..4].copy_from_slice(&self.ssrc.to_be_bytes());
        buf[FRACTION_LOST_OFFSET] = self.fraction_lost;
        let lost = self.total_lost.to_be_bytes();
        buf[TOTAL_LOST_OFFSET..TOTAL_LOST_OFFSET + 3].copy_from_slice(&lost[1..]);
        buf[LAST_SEQ_OFFSET..LAST_SEQ_OFFSET + 4]
            .copy_from_slice(&self.last_sequence_number.to_be_bytes());
        buf[JITTER_OFFSET..JITTER_OFFSET + 4].copy_from_slice(&self.jitter.to_be_bytes());
        buf[LAST_SR_OFFSET..LAST_SR_OFFSET + 4]
            .copy_from_slice(&self.last_sender_report.to_be_bytes());
        buf[DELAY_OFFSET..DELAY_OFFSET + 4].copy_from_slice(&self.delay.to_be_bytes());
        Ok(RECEPTION_REPORT_LENGTH)
    }
}

impl Unmarshal for ReceptionReport {
    fn unmarshal<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < RECEPTION_REPORT_LENGTH {
            return Err(Error::PacketTooShort);
        }
        let ssrc = buf.get_u32();
        let fraction_lost = buf.get_u8();
        let total_lost =
            ((buf.get_u8() as u32) << 16) | ((buf.get_u8() as u32) << 8) | buf.get_u8() as u32;
        let last_sequence_number = buf.get_u32();
        let jitter = buf.get_u32();
        let last_sender_report = buf.get_u32();
        let delay = buf.get_u32();
        Ok(ReceptionReport {
            ssrc,
            fraction_lost,
            total_lost,
            last_sequence_number,
            jitter,
            last_sender_report,
            delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let r = ReceptionReport {
            ssrc: 902880,
            fraction_lost: 85,
            total_lost: 289,
            last_sequence_number: 23456,
            jitter: 3788,
            last_sender_report: 0x9F36432,
            delay: 150137,
        };
        let raw = r.marshal().unwrap();
        assert_eq!(raw.len(), RECEPTION_REPORT_LENGTH);
        assert_eq!(ReceptionReport::unmarshal(&mut raw.clone()).unwrap(), r);
    }

    #[test]
    fn test_total_lost_overflow() {
        let r = ReceptionReport {
            total_lost: 1 << 24,
            ..Default::default()
        };
        assert_eq!(r.marshal(), Err(Error::InvalidTotalLost));
    }
}

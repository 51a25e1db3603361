use std::time::{Instant, SystemTime};

use shared::time::ntp_encode;

/// Per-(session, format) transmission statistics for a publisher, drained
/// by the periodic sender report.
pub struct SenderStats {
    clock_rate: f64,
    ssrc: Option<u32>,

    last_rtp_time_rtp: u32,
    last_rtp_time_time: Instant,
    /// Application-supplied wallclock/RTP mapping, when present; otherwise
    /// the report extrapolates from the system clock.
    ntp_rtp_pair: Option<(SystemTime, u32)>,

    packets: u32,
    octets: u32,
}

impl SenderStats {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate: clock_rate as f64,
            ssrc: None,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: Instant::now(),
            ntp_rtp_pair: None,
            packets: 0,
            octets: 0,
        }
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    pub fn packet_count(&self) -> u32 {
        self.packets
    }

    pub fn octet_count(&self) -> u32 {
        self.octets
    }

    /// Pins the wallclock/RTP-timestamp correspondence advertised in the
    /// next sender reports.
    pub fn set_ntp_rtp(&mut self, wallclock: SystemTime, rtp_time: u32) {
        self.ntp_rtp_pair = Some((wallclock, rtp_time));
    }

    pub fn process_rtp(&mut self, now: Instant, header: &rtp::Header, payload_len: usize) {
        // always update time to minimize extrapolation error
        self.last_rtp_time_rtp = header.timestamp;
        self.last_rtp_time_time = now;
        self.ssrc = Some(header.ssrc);

        self.packets = self.packets.wrapping_add(1);
        self.octets = self
            .octets
            .wrapping_add(u32::try_from(payload_len).unwrap_or(u32::MAX));
    }

    /// Builds the sender report for the current period, or `None` when
    /// nothing has been written yet.
    pub fn generate_report(&mut self, now: Instant) -> Option<rtcp::SenderReport> {
        let ssrc = self.ssrc?;

        let (ntp_time, rtp_time) = match self.ntp_rtp_pair {
            Some((wallclock, rtp)) => (ntp_encode(wallclock), rtp),
            None => (
                ntp_encode(SystemTime::now()),
                self.last_rtp_time_rtp.wrapping_add(
                    (now.duration_since(self.last_rtp_time_time).as_secs_f64() * self.clock_rate)
                        as u32,
                ),
            ),
        };

        Some(rtcp::SenderReport {
            ssrc,
            ntp_time,
            rtp_time,
            packet_count: self.packets,
            octet_count: self.octets,
            reports: vec![],
        })
    }
}

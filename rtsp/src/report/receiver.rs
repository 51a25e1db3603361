use std::time::Instant;

use shared::error::{Error, Result};
use shared::time::ntp_middle;

use crate::report::LOSS_EVENT_THRESHOLD;

/// Number of packets tracked per u64 entry in the bitmap.
const PACKETS_PER_ENTRY: usize = 64;
const BITMAP_SIZE: usize = 128;

/// What `process_rtp` observed about one incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RtpIngest {
    /// Consecutive packets skipped right before this one, when the run is
    /// long enough to be a reportable loss event.
    pub lost_run: Option<u64>,
}

/// Per-(session, format) reception statistics, fed by every incoming RTP
/// packet and drained by the periodic receiver report.
pub struct ReceiverStats {
    receiver_ssrc: u32,
    clock_rate: f64,

    /// SSRC pinned by the first packet; later packets must match.
    first_ssrc: Option<u32>,

    /// Bitmap for tracking received packets. Each u64 tracks 64 packets,
    /// for a total capacity of 8192.
    packets: Vec<u64>,
    started: bool,
    seq_num_cycles: u16,
    last_seq_num: u16,
    last_report_seq_num: u16,
    last_rtp_time_rtp: u32,
    last_rtp_time_time: Instant,
    jitter: f64,
    total_lost: u32,
    received: u64,

    last_sender_report: u32,
    last_sender_report_time: Option<Instant>,
}

impl ReceiverStats {
    pub fn new(clock_rate: u32, receiver_ssrc: u32) -> Self {
        Self {
            receiver_ssrc,
            clock_rate: clock_rate as f64,
            first_ssrc: None,
            packets: vec![0u64; BITMAP_SIZE],
            started: false,
            seq_num_cycles: 0,
            last_seq_num: 0,
            last_report_seq_num: 0,
            last_rtp_time_rtp: 0,
            last_rtp_time_time: Instant::now(),
            jitter: 0.0,
            total_lost: 0,
            received: 0,
            last_sender_report: 0,
            last_sender_report_time: None,
        }
    }

    pub fn first_ssrc(&self) -> Option<u32> {
        self.first_ssrc
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// The extended highest sequence number: cycle count in the upper 16
    /// bits, last sequence number in the lower 16.
    pub fn extended_highest_seq(&self) -> u32 {
        ((self.seq_num_cycles as u32) << 16) | self.last_seq_num as u32
    }

    fn set_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] |= 1 << (pos % PACKETS_PER_ENTRY);
    }

    fn del_received(&mut self, seq: u16) {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        self.packets[pos / PACKETS_PER_ENTRY] &= !(1u64 << (pos % PACKETS_PER_ENTRY));
    }

    fn get_received(&self, seq: u16) -> bool {
        let pos = (seq as usize) % (BITMAP_SIZE * PACKETS_PER_ENTRY);
        (self.packets[pos / PACKETS_PER_ENTRY] & (1 << (pos % PACKETS_PER_ENTRY))) != 0
    }

    /// Updates sequence tracking and jitter for one packet. A packet whose
    /// SSRC differs from the first seen is rejected with `WrongSsrc` and
    /// must not be delivered to the application.
    pub fn process_rtp(&mut self, now: Instant, header: &rtp::Header) -> Result<RtpIngest> {
        match self.first_ssrc {
            None => self.first_ssrc = Some(header.ssrc),
            Some(expected) if expected != header.ssrc => {
                return Err(Error::WrongSsrc {
                    got: header.ssrc,
                    expected,
                });
            }
            Some(_) => {}
        }

        let seq = header.sequence_number;
        let mut ingest = RtpIngest::default();
        self.received += 1;

        if !self.started {
            // first packet
            self.started = true;
            self.set_received(seq);
            self.last_seq_num = seq;
            self.last_report_seq_num = seq.wrapping_sub(1);
            self.last_rtp_time_rtp = header.timestamp;
            self.last_rtp_time_time = now;
            return Ok(ingest);
        }

        self.set_received(seq);

        // u16 arithmetic: diff in (0, 2^15) means the packet moved forward
        let diff = seq.wrapping_sub(self.last_seq_num);
        if diff > 0 && diff < (1 << 15) {
            if seq < self.last_seq_num {
                self.seq_num_cycles = self.seq_num_cycles.wrapping_add(1);
            }

            // mark skipped packets as missing
            let missing = (diff - 1) as u64;
            let mut i = self.last_seq_num.wrapping_add(1);
            while i != seq {
                self.del_received(i);
                i = i.wrapping_add(1);
            }
            if missing >= LOSS_EVENT_THRESHOLD {
                ingest.lost_run = Some(missing);
            }

            self.last_seq_num = seq;
        }

        // interarrival jitter, RFC 3550 A.8
        let d = now.duration_since(self.last_rtp_time_time).as_secs_f64() * self.clock_rate
            - (header.timestamp as f64 - self.last_rtp_time_rtp as f64);
        self.jitter += (d.abs() - self.jitter) / 16.0;

        self.last_rtp_time_rtp = header.timestamp;
        self.last_rtp_time_time = now;

        Ok(ingest)
    }

    /// Records the NTP middle bits and arrival time of a sender report so
    /// the next receiver report can answer with LSR/DLSR.
    pub fn process_sender_report(&mut self, now: Instant, sr: &rtcp::SenderReport) {
        self.last_sender_report = ntp_middle(sr.ntp_time);
        self.last_sender_report_time = Some(now);
    }

    /// Builds the receiver report for the current period, or `None` when
    /// no packet has been seen yet.
    pub fn generate_report(&mut self, now: Instant) -> Option<rtcp::ReceiverReport> {
        if !self.started {
            return None;
        }
        let ssrc = self.first_ssrc?;

        let total_since_report = self.last_seq_num.wrapping_sub(self.last_report_seq_num);
        let mut lost_since_report = {
            if self.last_seq_num == self.last_report_seq_num {
                0u32
            } else {
                let mut ret = 0u32;
                let mut i = self.last_report_seq_num.wrapping_add(1);
                while i != self.last_seq_num {
                    if !self.get_received(i) {
                        ret += 1;
                    }
                    i = i.wrapping_add(1);
                }
                ret
            }
        };

        self.total_lost = self.total_lost.saturating_add(lost_since_report);

        // both counters are 24-bit fields on the wire
        if lost_since_report > 0xFFFFFF {
            lost_since_report = 0xFFFFFF;
        }
        if self.total_lost > 0xFFFFFF {
            self.total_lost = 0xFFFFFF;
        }

        // DLSR in 1/65536 s; zero when no SR has been received
        let delay = match self.last_sender_report_time {
            Some(sr_time) => (now.duration_since(sr_time).as_secs_f64() * 65536.0) as u32,
            None => 0,
        };

        let fraction_lost = if total_since_report > 0 {
            ((lost_since_report * 256) as f64 / total_since_report as f64) as u8
        } else {
            0
        };

        let report = rtcp::ReceiverReport {
            ssrc: self.receiver_ssrc,
            reports: vec![rtcp::ReceptionReport {
                ssrc,
                fraction_lost,
                total_lost: self.total_lost,
                last_sequence_number: self.extended_highest_seq(),
                jitter: self.jitter as u32,
                last_sender_report: self.last_sender_report,
                delay,
            }],
        };

        self.last_report_seq_num = self.last_seq_num;

        Some(report)
    }
}

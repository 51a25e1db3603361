//! Per-media client plumbing: sockets or channels, the receive path into
//! the application callbacks, and transmission statistics for recording.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use shared::error::Error;
use shared::marshal::Unmarshal;

use crate::client::{OnClientDecodeError, OnClientPacketLost, OnClientPacketRtcp, OnClientPacketRtp};
use crate::headers::TransportKind;
use crate::report::{ReceiverStats, SenderStats};
use crate::udp::{UdpPair, UdpWriter};

/// The receive path of one set-up media, shared with its socket reader
/// tasks (or frame sinks) and the report timer.
pub(crate) struct MediaIngest {
    pub(crate) media_idx: usize,
    pub(crate) recv_stats: Mutex<ReceiverStats>,
    pub(crate) send_stats: Mutex<SenderStats>,
    /// Decrypt context for incoming SRTP/SRTCP (from the publisher MIKEY).
    pub(crate) srtp_in: Option<Mutex<srtp::Context>>,
    /// Encrypt context for outgoing packets (RTCP answers, recording).
    pub(crate) srtp_out: Option<Mutex<srtp::Context>>,
    /// Set by the first accepted RTP packet; the UDP silence watchdog
    /// polls it.
    pub(crate) got_rtp: AtomicBool,

    pub(crate) on_packet_rtp: Option<OnClientPacketRtp>,
    pub(crate) on_packet_rtcp: Option<OnClientPacketRtcp>,
    pub(crate) on_decode_error: Option<OnClientDecodeError>,
    pub(crate) on_packet_lost: Option<OnClientPacketLost>,
}

impl MediaIngest {
    pub(crate) fn handle_rtp(&self, data: Bytes) {
        let data = match &self.srtp_in {
            Some(ctx) => match ctx.lock().unprotect_rtp(&data) {
                Ok(d) => d,
                Err(e) => {
                    self.decode_error(&e);
                    return;
                }
            },
            None => data,
        };

        let packet = match rtp::Packet::unmarshal(&mut data.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.decode_error(&e);
                return;
            }
        };

        let ingest = self
            .recv_stats
            .lock()
            .process_rtp(Instant::now(), &packet.header);
        let ingest = match ingest {
            Ok(i) => i,
            Err(e) => {
                self.decode_error(&e);
                return;
            }
        };
        self.got_rtp.store(true, Ordering::Release);

        if let (Some(lost), Some(cb)) = (ingest.lost_run, &self.on_packet_lost) {
            cb(lost);
        }
        if let Some(cb) = &self.on_packet_rtp {
            cb(self.media_idx, packet.header.payload_type, packet);
        }
    }

    pub(crate) fn handle_rtcp(&self, data: Bytes) {
        let data = match &self.srtp_in {
            Some(ctx) => match ctx.lock().unprotect_rtcp(&data) {
                Ok(d) => d,
                Err(e) => {
                    self.decode_error(&e);
                    return;
                }
            },
            None => data,
        };

        let packets = match rtcp::RtcpPacket::unmarshal_compound(&data) {
            Ok(p) => p,
            Err(e) => {
                self.decode_error(&e);
                return;
            }
        };

        let now = Instant::now();
        for packet in packets {
            if let rtcp::RtcpPacket::SenderReport(sr) = &packet {
                self.recv_stats.lock().process_sender_report(now, sr);
            }
            if let Some(cb) = &self.on_packet_rtcp {
                cb(self.media_idx, packet);
            }
        }
    }

    fn decode_error(&self, e: &Error) {
        log::debug!("media {}: decode error: {e}", self.media_idx);
        if let Some(cb) = &self.on_decode_error {
            cb("media", e);
        }
    }
}

/// One set-up media of the client session.
pub(crate) struct MediaSetup {
    pub(crate) media_idx: usize,
    pub(crate) kind: TransportKind,
    pub(crate) control_url: String,
    pub(crate) ingest: Arc<MediaIngest>,

    // UDP transports
    pub(crate) udp: Option<UdpPair>,
    pub(crate) udp_rtp_writer: Option<UdpWriter>,
    pub(crate) udp_rtcp_writer: Option<UdpWriter>,
    pub(crate) server_rtp_dest: Option<SocketAddr>,
    pub(crate) server_rtcp_dest: Option<SocketAddr>,
    pub(crate) udp_tasks: Vec<tokio::task::JoinHandle<()>>,

    // TCP interleaved
    pub(crate) channels: Option<(u8, u8)>,
}

impl MediaSetup {
    pub(crate) fn abort_tasks(&self) {
        for task in &self.udp_tasks {
            task.abort();
        }
    }
}

//! The source of truth for published media: holds the prepared session
//! description, fans written packets out to every registered reader, and
//! keeps the per-media state PLAY responses and sender reports need.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::{Rng, rng};

use sdp::{SessionDescription, TransportProfile};
use shared::error::{Error, Result};
use shared::marshal::Marshal;
use shared::time::ntp_encode;

use crate::conn::ConnWriter;
use crate::report::{DEFAULT_REPORT_PERIOD, SenderStats};
use crate::udp::{UdpWriter, bind_multicast, spawn_udp_writer};

/// Where one reader receives one media.
#[derive(Clone)]
pub(crate) enum MediaWriters {
    Udp {
        rtp: UdpWriter,
        rtcp: UdpWriter,
        rtp_dest: SocketAddr,
        rtcp_dest: SocketAddr,
    },
    Tcp {
        writer: ConnWriter,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

struct ReaderSlot {
    medias: Vec<Option<MediaWriters>>,
    multicast: bool,
}

struct MulticastMedia {
    rtp: UdpWriter,
    rtcp: UdpWriter,
    rtp_dest: SocketAddr,
    rtcp_dest: SocketAddr,
}

struct MulticastBinding {
    group: Ipv4Addr,
    ports: (u16, u16),
    ttl: u8,
    medias: Vec<MulticastMedia>,
}

struct MediaPubState {
    last_seq: Option<u16>,
    last_rtptime: Option<u32>,
    sender: SenderStats,
}

struct StreamState {
    readers: Vec<Option<ReaderSlot>>,
    free: Vec<usize>,
    multicast: Option<MulticastBinding>,
    medias: Vec<MediaPubState>,
}

/// A published stream. Applications hand it to the server from the
/// describe/setup handlers and push media through [`write_packet`].
///
/// [`write_packet`]: ServerStream::write_packet
pub struct ServerStream {
    description: SessionDescription,
    report_period: Duration,
    /// Publisher-side SRTP encrypt context, present when any media is SAVP.
    srtp: Option<Mutex<srtp::Context>>,
    inner: RwLock<StreamState>,
    report_task_spawned: AtomicBool,
}

impl ServerStream {
    pub fn new(description: SessionDescription) -> Result<Arc<Self>> {
        Self::with_report_period(description, DEFAULT_REPORT_PERIOD)
    }

    pub fn with_report_period(
        mut description: SessionDescription,
        report_period: Duration,
    ) -> Result<Arc<Self>> {
        let has_savp = description
            .medias
            .iter()
            .any(|m| m.profile == TransportProfile::Savp);

        let srtp = if has_savp {
            let mut rng = rng();
            let key: [u8; srtp::MASTER_KEY_LEN] = rng.random();
            let salt: [u8; srtp::MASTER_SALT_LEN] = rng.random();
            let mikey = srtp::MikeyMessage::new(
                rng.random(),
                ntp_encode(SystemTime::now()),
                &key,
                &salt,
            )?;
            let blob = mikey.marshal();
            for media in &mut description.medias {
                if media.profile == TransportProfile::Savp && media.key_mgmt.is_none() {
                    media.key_mgmt = Some(blob.clone());
                }
            }
            Some(Mutex::new(srtp::Context::new(&key, &salt)?))
        } else {
            None
        };

        description.prepare()?;

        let medias = description
            .medias
            .iter()
            .map(|m| MediaPubState {
                last_seq: None,
                last_rtptime: None,
                sender: SenderStats::new(m.formats.first().map(|f| f.clock_rate).unwrap_or(90000)),
            })
            .collect();

        Ok(Arc::new(Self {
            description,
            report_period,
            srtp,
            inner: RwLock::new(StreamState {
                readers: Vec::new(),
                free: Vec::new(),
                multicast: None,
                medias,
            }),
            report_task_spawned: AtomicBool::new(false),
        }))
    }

    pub fn description(&self) -> &SessionDescription {
        &self.description
    }

    pub fn reader_count(&self) -> usize {
        self.inner.read().readers.iter().flatten().count()
    }

    /// Pins the wallclock/RTP mapping carried in this media's sender
    /// reports.
    pub fn set_ntp_rtp(&self, media_idx: usize, wallclock: SystemTime, rtp_time: u32) {
        let mut state = self.inner.write();
        if let Some(media) = state.medias.get_mut(media_idx) {
            media.sender.set_ntp_rtp(wallclock, rtp_time);
        }
    }

    /// Publishes one RTP packet on a media: updates bookkeeping, encrypts
    /// once when the stream is SAVP, and fans the serialized packet out to
    /// every reader of that media. A reader whose write queue is full is
    /// skipped and the overflow is reported to the caller after the other
    /// readers were served.
    pub fn write_packet(&self, media_idx: usize, packet: &rtp::Packet) -> Result<()> {
        let raw = packet.marshal()?;
        let raw = match &self.srtp {
            Some(ctx) => ctx.lock().protect_rtp(&raw)?,
            None => raw,
        };

        let (writers, mcast) = {
            let mut state = self.inner.write();
            let media = state
                .medias
                .get_mut(media_idx)
                .ok_or_else(|| Error::BadRequest(format!("no media {media_idx}")))?;
            media.last_seq = Some(packet.header.sequence_number);
            media.last_rtptime = Some(packet.header.timestamp);
            media
                .sender
                .process_rtp(Instant::now(), &packet.header, packet.payload.len());
            self.snapshot(&state, media_idx)
        };

        self.fan_out(&writers, mcast.as_ref(), raw, false)
    }

    /// Fans a serialized RTCP packet out on a media's RTCP path.
    pub fn write_rtcp(&self, media_idx: usize, raw: Bytes) -> Result<()> {
        let raw = match &self.srtp {
            Some(ctx) => ctx.lock().protect_rtcp(&raw)?,
            None => raw,
        };
        let (writers, mcast) = {
            let state = self.inner.read();
            if media_idx >= state.medias.len() {
                return Err(Error::BadRequest(format!("no media {media_idx}")));
            }
            self.snapshot(&state, media_idx)
        };
        self.fan_out(&writers, mcast.as_ref(), raw, true)
    }

    /// Per-publish snapshot: the unicast writers of every reader set up for
    /// this media, plus the shared multicast writer when one exists and at
    /// least one multicast reader is registered.
    fn snapshot(
        &self,
        state: &StreamState,
        media_idx: usize,
    ) -> (Vec<MediaWriters>, Option<(UdpWriter, UdpWriter, SocketAddr, SocketAddr)>) {
        let mut writers = Vec::new();
        let mut any_multicast = false;
        for slot in state.readers.iter().flatten() {
            if slot.multicast {
                any_multicast = true;
                continue;
            }
            if let Some(Some(w)) = slot.medias.get(media_idx) {
                writers.push(w.clone());
            }
        }
        let mcast = match (&state.multicast, any_multicast) {
            (Some(binding), true) => binding.medias.get(media_idx).map(|m| {
                (m.rtp.clone(), m.rtcp.clone(), m.rtp_dest, m.rtcp_dest)
            }),
            _ => None,
        };
        (writers, mcast)
    }

    fn fan_out(
        &self,
        writers: &[MediaWriters],
        mcast: Option<&(UdpWriter, UdpWriter, SocketAddr, SocketAddr)>,
        raw: Bytes,
        rtcp: bool,
    ) -> Result<()> {
        let mut overflow = None;

        for w in writers {
            let res = match w {
                MediaWriters::Udp {
                    rtp,
                    rtcp: rtcp_w,
                    rtp_dest,
                    rtcp_dest,
                } => {
                    if rtcp {
                        rtcp_w.try_enqueue(raw.clone(), *rtcp_dest)
                    } else {
                        rtp.try_enqueue(raw.clone(), *rtp_dest)
                    }
                }
                MediaWriters::Tcp {
                    writer,
                    rtp_channel,
                    rtcp_channel,
                } => {
                    let channel = if rtcp { *rtcp_channel } else { *rtp_channel };
                    let frame = crate::message::Frame {
                        channel,
                        payload: raw.clone(),
                    };
                    match frame.marshal() {
                        Ok(buf) => writer.try_enqueue(buf),
                        Err(e) => Err(e),
                    }
                }
            };
            match res {
                Ok(()) => {}
                Err(Error::WriteQueueFull) => overflow = Some(Error::WriteQueueFull),
                Err(e) => log::debug!("stream fan-out write failed: {e}"),
            }
        }

        if let Some((rtp_w, rtcp_w, rtp_dest, rtcp_dest)) = mcast {
            let res = if rtcp {
                rtcp_w.try_enqueue(raw.clone(), *rtcp_dest)
            } else {
                rtp_w.try_enqueue(raw.clone(), *rtp_dest)
            };
            if let Err(Error::WriteQueueFull) = res {
                overflow = Some(Error::WriteQueueFull);
            }
        }

        match overflow {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Next-packet RTP-Info values for a media: `(seq, rtptime)`.
    pub(crate) fn rtp_info(&self, media_idx: usize) -> (Option<u16>, Option<u32>) {
        let state = self.inner.read();
        match state.medias.get(media_idx) {
            Some(m) => (m.last_seq.map(|s| s.wrapping_add(1)), m.last_rtptime),
            None => (None, None),
        }
    }

    /// Registers a reader and returns its stable slot id. `medias[i]` is
    /// `None` for medias the session did not set up.
    pub(crate) fn add_reader(
        self: &Arc<Self>,
        medias: Vec<Option<MediaWriters>>,
        multicast: bool,
    ) -> usize {
        self.spawn_report_task();
        let mut state = self.inner.write();
        let slot = ReaderSlot { medias, multicast };
        match state.free.pop() {
            Some(id) => {
                state.readers[id] = Some(slot);
                id
            }
            None => {
                state.readers.push(Some(slot));
                state.readers.len() - 1
            }
        }
    }

    pub(crate) fn remove_reader(&self, id: usize) {
        let mut state = self.inner.write();
        if id < state.readers.len() && state.readers[id].take().is_some() {
            state.free.push(id);
        }
    }

    /// The multicast binding already attached to this stream, if any.
    pub(crate) fn multicast_info(&self) -> Option<(Ipv4Addr, (u16, u16), u8)> {
        let state = self.inner.read();
        state
            .multicast
            .as_ref()
            .map(|b| (b.group, b.ports, b.ttl))
    }

    /// Lazily binds the shared multicast sockets for every media and
    /// returns `(group, ports, ttl)` for the SETUP response.
    pub(crate) fn multicast_binding(
        &self,
        group: Ipv4Addr,
        ports: (u16, u16),
        ttl: u8,
        queue_capacity: usize,
    ) -> Result<(Ipv4Addr, (u16, u16), u8)> {
        let mut state = self.inner.write();
        if let Some(binding) = &state.multicast {
            return Ok((binding.group, binding.ports, binding.ttl));
        }

        let mut medias = Vec::with_capacity(self.description.medias.len());
        for _ in 0..self.description.medias.len() {
            let rtp_socket = bind_multicast(group, ports.0, ttl as u32)?;
            let rtcp_socket = bind_multicast(group, ports.1, ttl as u32)?;
            medias.push(MulticastMedia {
                rtp: spawn_udp_writer(rtp_socket, queue_capacity),
                rtcp: spawn_udp_writer(rtcp_socket, queue_capacity),
                rtp_dest: SocketAddr::from((group, ports.0)),
                rtcp_dest: SocketAddr::from((group, ports.1)),
            });
        }
        state.multicast = Some(MulticastBinding {
            group,
            ports,
            ttl,
            medias,
        });
        Ok((group, ports, ttl))
    }

    /// Periodic sender-report task, started with the first reader. Holds a
    /// weak reference so dropping the stream stops it.
    fn spawn_report_task(self: &Arc<Self>) {
        if self.report_task_spawned.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<ServerStream> = Arc::downgrade(self);
        let period = self.report_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(stream) = weak.upgrade() else {
                    return;
                };
                let reports: Vec<(usize, Bytes)> = {
                    let mut state = stream.inner.write();
                    let now = Instant::now();
                    let mut out = Vec::new();
                    for (i, media) in state.medias.iter_mut().enumerate() {
                        if let Some(sr) = media.sender.generate_report(now) {
                            if let Ok(raw) = sr.marshal() {
                                out.push((i, raw));
                            }
                        }
                    }
                    out
                };
                for (media_idx, raw) in reports {
                    if let Err(e) = stream.write_rtcp(media_idx, raw) {
                        log::debug!("sender report fan-out failed: {e}");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_media_description() -> SessionDescription {
        SessionDescription::parse(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n\
             m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n",
        )
        .unwrap()
    }

    #[test]
    fn test_prepare_assigns_control() {
        let stream = ServerStream::new(one_media_description()).unwrap();
        assert_eq!(
            stream.description().medias[0].control.as_deref(),
            Some("trackID=0")
        );
    }

    #[tokio::test]
    async fn test_rtp_info_tracks_writes() {
        let stream = ServerStream::new(one_media_description()).unwrap();
        assert_eq!(stream.rtp_info(0), (None, None));

        let packet = rtp::Packet {
            header: rtp::Header {
                payload_type: 96,
                sequence_number: 946,
                timestamp: 54352,
                ssrc: 753621,
                ..Default::default()
            },
            payload: Bytes::from_static(&[1, 2, 3, 4]),
        };
        stream.write_packet(0, &packet).unwrap();
        assert_eq!(stream.rtp_info(0), (Some(947), Some(54352)));
    }

    #[tokio::test]
    async fn test_reader_slots_are_stable() {
        let stream = ServerStream::new(one_media_description()).unwrap();
        let a = stream.add_reader(vec![None], false);
        let b = stream.add_reader(vec![None], false);
        assert_ne!(a, b);
        stream.remove_reader(a);
        assert_eq!(stream.reader_count(), 1);
        // released slot is reused
        let c = stream.add_reader(vec![None], false);
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn test_savp_stream_attaches_mikey() {
        let mut desc = one_media_description();
        desc.medias[0].profile = TransportProfile::Savp;
        let stream = ServerStream::new(desc).unwrap();
        let blob = stream.description().medias[0].key_mgmt.as_ref().unwrap();
        let mikey = srtp::MikeyMessage::parse(blob).unwrap();
        assert_eq!(mikey.tek.len(), srtp::MASTER_KEY_LEN);
        assert_eq!(mikey.salt.len(), srtp::MASTER_SALT_LEN);
    }

    #[tokio::test]
    async fn test_write_to_unknown_media_rejected() {
        let stream = ServerStream::new(one_media_description()).unwrap();
        let packet = rtp::Packet::default();
        assert!(stream.write_packet(3, &packet).is_err());
    }
}

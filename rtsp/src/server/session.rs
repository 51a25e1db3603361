//! Per-session control task (RFC 2326 §A). The task owns all mutable
//! session state; connections talk to it through its command channel and
//! wait on a oneshot for the response.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use sdp::SessionDescription;
use shared::error::Error;
use shared::marshal::{Marshal, Unmarshal};

use crate::headers::rtp_info::{RtpInfo, RtpInfoEntry};
use crate::headers::transport::Delivery;
use crate::headers::{SessionHeader, TransportHeader, TransportKind, TransportMode};
use crate::message::{Frame, Method, Request, Response, StatusCode};
use crate::report::ReceiverStats;
use crate::server::stream::{MediaWriters, ServerStream};
use crate::server::{ConnCtx, FrameRoute, ServerInner, SessionHandle};
use crate::udp::{
    BufferPool, SourceFilter, UdpPair, UdpWriter, bind_udp_pair, spawn_udp_reader,
    spawn_udp_writer,
};

/// The server session state machine of RFC 2326 §A.1, with distinct
/// pre-states for the reading and recording directions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SessionState {
    Initial,
    PreRead,
    Read,
    PreRecord,
    Record,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Initial => "Initial",
            SessionState::PreRead => "PreRead",
            SessionState::Read => "Read",
            SessionState::PreRecord => "PreRecord",
            SessionState::Record => "Record",
        }
    }
}

pub(crate) enum SessionCmd {
    Request {
        req: Request,
        ctx: ConnCtx,
        reply: oneshot::Sender<Response>,
    },
    MediaData {
        media_idx: usize,
        rtcp: bool,
        data: Bytes,
    },
    ConnClosed {
        conn_id: u64,
    },
    Shutdown,
}

/// One set-up media of a session.
struct MediaSetup {
    media_idx: usize,
    udp: Option<UdpPair>,
    udp_rtcp_writer: Option<UdpWriter>,
    udp_tasks: Vec<tokio::task::JoinHandle<()>>,
    udp_rtp_writer: Option<UdpWriter>,
    client_rtp_dest: Option<SocketAddr>,
    client_rtcp_dest: Option<SocketAddr>,
    channels: Option<(u8, u8)>,
    conn_writer: Option<crate::conn::ConnWriter>,
    recv_stats: Arc<Mutex<ReceiverStats>>,
}

struct SessionTask {
    id: String,
    inner: Arc<ServerInner>,
    tx: mpsc::Sender<SessionCmd>,
    state: SessionState,
    path: Option<String>,
    transport_kind: Option<TransportKind>,
    setups: Vec<MediaSetup>,
    stream: Option<Arc<ServerStream>>,
    reader_slot: Option<usize>,
    announced: Option<SessionDescription>,
    srtp_in: Option<srtp::Context>,
    conn_ids: HashSet<u64>,
    udp_bindings: Vec<(IpAddr, u16)>,
    frame_channels: Vec<(ConnCtx, u8)>,
    last_activity: Instant,
    last_receiver_report: Instant,
    closed: bool,
}

/// Spawns the control task and returns its handle.
pub(crate) fn spawn(inner: Arc<ServerInner>, id: String) -> SessionHandle {
    let (tx, rx) = mpsc::channel(64);
    let handle = SessionHandle {
        id: id.clone(),
        tx: tx.clone(),
    };
    let task = SessionTask {
        id,
        inner,
        tx,
        state: SessionState::Initial,
        path: None,
        transport_kind: None,
        setups: Vec::new(),
        stream: None,
        reader_slot: None,
        announced: None,
        srtp_in: None,
        conn_ids: HashSet::new(),
        udp_bindings: Vec::new(),
        frame_channels: Vec::new(),
        last_activity: Instant::now(),
        last_receiver_report: Instant::now(),
        closed: false,
    };
    tokio::spawn(task.run(rx));
    handle
}

impl SessionTask {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCmd>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.closed {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(SessionCmd::Request { req, ctx, reply }) => {
                        self.conn_ids.insert(ctx.conn_id);
                        let res = self.handle_request(req, &ctx).await;
                        let _ = reply.send(res);
                    }
                    Some(SessionCmd::MediaData { media_idx, rtcp, data }) => {
                        self.handle_media_data(media_idx, rtcp, data);
                    }
                    Some(SessionCmd::ConnClosed { conn_id }) => {
                        self.conn_ids.remove(&conn_id);
                        if self.transport_kind == Some(TransportKind::TcpInterleaved)
                            && self.conn_ids.is_empty()
                        {
                            log::debug!("session {}: control connection lost", self.id);
                            self.close();
                        }
                    }
                    Some(SessionCmd::Shutdown) | None => self.close(),
                },
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn tick(&mut self) {
        if self.last_activity.elapsed() > self.inner.session_timeout {
            log::debug!("session {}: idle timeout", self.id);
            self.close();
            return;
        }

        if self.state == SessionState::Record
            && self.last_receiver_report.elapsed() >= self.inner.report_period
        {
            self.last_receiver_report = Instant::now();
            self.emit_receiver_reports();
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let (Some(stream), Some(slot)) = (&self.stream, self.reader_slot) {
            stream.remove_reader(slot);
        }
        for setup in &self.setups {
            for task in &setup.udp_tasks {
                task.abort();
            }
        }
        for (ctx, channel) in &self.frame_channels {
            ctx.frame_routes.lock().remove(channel);
        }
        {
            let mut bindings = self.inner.registry.udp_bindings.lock();
            for b in &self.udp_bindings {
                bindings.remove(b);
            }
        }
        self.inner.registry.sessions.write().remove(&self.id);
        log::debug!("session {}: closed", self.id);
    }

    fn session_header(&self) -> String {
        SessionHeader::new(self.id.clone())
            .with_timeout(self.inner.session_timeout.as_secs())
            .to_string()
    }

    fn reply(&self, req: &Request, status: StatusCode) -> Response {
        let mut res = Response::new(status);
        if let Ok(cseq) = req.cseq() {
            res.headers.set("CSeq", cseq.to_string());
        }
        res.headers.set("Session", self.session_header());
        res
    }

    fn not_valid(&self, req: &Request) -> Response {
        log::debug!(
            "session {}: {} not valid in state {}",
            self.id,
            req.method,
            self.state.name()
        );
        self.reply(req, StatusCode::METHOD_NOT_VALID_IN_THIS_STATE)
    }

    async fn handle_request(&mut self, req: Request, ctx: &ConnCtx) -> Response {
        self.touch();
        match req.method {
            Method::Options | Method::GetParameter | Method::SetParameter => {
                // keepalive; the idle timer was reset above
                self.reply(&req, StatusCode::OK)
            }
            Method::Announce => self.handle_announce(&req),
            Method::Setup => self.handle_setup(&req, ctx).await,
            Method::Play => self.handle_play(&req),
            Method::Record => self.handle_record(&req),
            Method::Pause => self.handle_pause(&req),
            Method::Teardown => {
                let res = self.reply(&req, StatusCode::OK);
                self.close();
                res
            }
            Method::Describe => self.not_valid(&req),
        }
    }

    fn handle_announce(&mut self, req: &Request) -> Response {
        if self.state != SessionState::Initial {
            return self.not_valid(req);
        }
        let Some(handler) = self.inner.handlers.announce.clone() else {
            return self.reply(req, StatusCode::NOT_IMPLEMENTED);
        };

        let Ok(body) = std::str::from_utf8(&req.body) else {
            return self.reply(req, StatusCode::BAD_REQUEST);
        };
        let mut description = match SessionDescription::parse(body) {
            Ok(d) => d,
            Err(e) => {
                log::debug!("session {}: bad ANNOUNCE sdp: {e}", self.id);
                return self.reply(req, StatusCode::BAD_REQUEST);
            }
        };
        if let Err(e) = description.prepare() {
            log::debug!("session {}: ANNOUNCE description invalid: {e}", self.id);
            return self.reply(req, StatusCode::BAD_REQUEST);
        }

        let (path, query) = split_path_query(&req.url);
        let status = handler(&path, &query, &description);
        if !status.is_success() {
            return self.reply(req, status);
        }

        // the publisher's MIKEY blob keys the receive direction
        let blob = description
            .medias
            .iter()
            .filter_map(|m| m.key_mgmt.as_ref())
            .next()
            .or(description.key_mgmt.as_ref());
        if let Some(blob) = blob {
            match srtp::MikeyMessage::parse(blob)
                .and_then(|m| srtp::Context::new(&m.tek, &m.salt))
            {
                Ok(c) => self.srtp_in = Some(c),
                Err(e) => {
                    log::debug!("session {}: bad MIKEY in ANNOUNCE: {e}", self.id);
                    return self.reply(req, StatusCode::BAD_REQUEST);
                }
            }
        }

        self.path = Some(path);
        self.announced = Some(description);
        self.reply(req, StatusCode::OK)
    }

    async fn handle_setup(&mut self, req: &Request, ctx: &ConnCtx) -> Response {
        let record_mode = match self.state {
            SessionState::Initial => self.announced.is_some(),
            SessionState::PreRead => false,
            SessionState::PreRecord => true,
            _ => return self.not_valid(req),
        };

        let Some(raw_transport) = req.headers.get("Transport") else {
            return self.reply(req, StatusCode::BAD_REQUEST);
        };
        let th: TransportHeader = match raw_transport.parse() {
            Ok(t) => t,
            Err(e) => {
                log::debug!("session {}: bad Transport header: {e}", self.id);
                return self.reply(req, StatusCode::BAD_REQUEST);
            }
        };
        if let Some(mode) = th.mode {
            if record_mode != (mode == TransportMode::Record) {
                return self.reply(req, StatusCode::BAD_REQUEST);
            }
        }

        if self.inner.srtp_mandatory && !th.secure {
            return self.reply(req, StatusCode::UNSUPPORTED_TRANSPORT);
        }

        let kind = match th.kind() {
            Ok(k) => k,
            Err(_) => return self.reply(req, StatusCode::UNSUPPORTED_TRANSPORT),
        };
        if let Some(existing) = self.transport_kind {
            if existing != kind {
                return self.reply(req, StatusCode::BAD_REQUEST);
            }
        }
        match kind {
            TransportKind::UdpUnicast if !self.inner.udp_enable => {
                return self.reply(req, StatusCode::UNSUPPORTED_TRANSPORT);
            }
            TransportKind::UdpMulticast if !self.inner.multicast_enable || record_mode => {
                return self.reply(req, StatusCode::UNSUPPORTED_TRANSPORT);
            }
            _ => {}
        }

        let (path, query) = split_path_query(&req.url);
        let base_path = strip_control_token(&path);

        // resolve the description and, in play mode, the stream
        let (description, stream) = if record_mode {
            match &self.announced {
                Some(d) => (d.clone(), None),
                None => return self.not_valid(req),
            }
        } else {
            let Some(handler) = self.inner.handlers.setup.clone() else {
                return self.reply(req, StatusCode::NOT_IMPLEMENTED);
            };
            let answer = handler(&base_path, &query, kind);
            if !answer.status.is_success() {
                return self.reply(req, answer.status);
            }
            let Some(stream) = answer.stream else {
                return self.reply(req, StatusCode::NOT_FOUND);
            };
            (stream.description().clone(), Some(stream))
        };

        let Some(media_idx) = description.find_media_by_control(&req.url) else {
            return self.reply(req, StatusCode::NOT_FOUND);
        };

        // path coherence across every SETUP of the session
        if let Some(existing) = &self.path {
            if *existing != base_path {
                let res = self.reply(req, StatusCode::BAD_REQUEST);
                self.close();
                return res;
            }
        } else {
            self.path = Some(base_path);
        }

        if self.setups.iter().any(|s| s.media_idx == media_idx) {
            return self.reply(req, StatusCode::BAD_REQUEST);
        }

        // a subscriber's MIKEY answer keys the RTCP it sends back
        if let Some(value) = req.headers.get("KeyMgmt") {
            if let Some(blob) = value.strip_prefix("mikey ") {
                let parsed = BASE64
                    .decode(blob.trim())
                    .map_err(|_| Error::Mikey("bad base64".to_owned()))
                    .and_then(|raw| srtp::MikeyMessage::parse(&raw))
                    .and_then(|m| srtp::Context::new(&m.tek, &m.salt));
                match parsed {
                    Ok(c) => self.srtp_in = Some(c),
                    Err(e) => {
                        log::debug!("session {}: bad KeyMgmt header: {e}", self.id);
                        return self.reply(req, StatusCode::BAD_REQUEST);
                    }
                }
            }
        }

        let clock_rate = description.medias[media_idx]
            .formats
            .first()
            .map(|f| f.clock_rate)
            .unwrap_or(90000);

        let mut setup = MediaSetup {
            media_idx,
            udp: None,
            udp_rtp_writer: None,
            udp_rtcp_writer: None,
            udp_tasks: Vec::new(),
            client_rtp_dest: None,
            client_rtcp_dest: None,
            channels: None,
            conn_writer: None,
            recv_stats: Arc::new(Mutex::new(ReceiverStats::new(clock_rate, rand::random()))),
        };

        let mut res_th = TransportHeader {
            secure: th.secure,
            ..Default::default()
        };

        match kind {
            TransportKind::UdpUnicast => {
                let Some(client_port) = th.client_port else {
                    return self.reply(req, StatusCode::BAD_REQUEST);
                };
                {
                    // a second session with the same source address and
                    // client ports would make the listener ambiguous
                    let mut bindings = self.inner.registry.udp_bindings.lock();
                    if !bindings.insert((ctx.remote_ip, client_port.0)) {
                        return self.reply(req, StatusCode::BAD_REQUEST);
                    }
                }
                self.udp_bindings.push((ctx.remote_ip, client_port.0));

                let pair = match bind_udp_pair(IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await {
                    Ok(p) => p,
                    Err(e) => {
                        log::warn!("session {}: udp bind failed: {e}", self.id);
                        return self.reply(req, StatusCode::INTERNAL_SERVER_ERROR);
                    }
                };

                let pool = BufferPool::new();
                let any_port = self.inner.any_port_enable;
                for (socket, port, is_rtcp) in [
                    (pair.rtp.clone(), client_port.0, false),
                    (pair.rtcp.clone(), client_port.1, true),
                ] {
                    let tx = self.tx.clone();
                    let filter = SourceFilter::new(ctx.remote_ip, Some(port), any_port);
                    setup.udp_tasks.push(spawn_udp_reader(
                        socket,
                        filter,
                        pool.clone(),
                        Arc::new(move |data| {
                            let _ = tx.try_send(SessionCmd::MediaData {
                                media_idx,
                                rtcp: is_rtcp,
                                data,
                            });
                        }),
                    ));
                }

                setup.udp_rtp_writer =
                    Some(spawn_udp_writer(pair.rtp.clone(), self.inner.write_queue_size));
                setup.udp_rtcp_writer =
                    Some(spawn_udp_writer(pair.rtcp.clone(), self.inner.write_queue_size));
                setup.client_rtp_dest = Some(SocketAddr::new(ctx.remote_ip, client_port.0));
                setup.client_rtcp_dest = Some(SocketAddr::new(ctx.remote_ip, client_port.1));

                res_th.delivery = Some(Delivery::Unicast);
                res_th.client_port = Some(client_port);
                res_th.server_port = Some((pair.rtp_port, pair.rtcp_port));
                setup.udp = Some(pair);
            }
            TransportKind::TcpInterleaved => {
                let channels = th
                    .interleaved
                    .unwrap_or((2 * self.setups.len() as u8, 2 * self.setups.len() as u8 + 1));
                {
                    let mut routes = ctx.frame_routes.lock();
                    routes.insert(
                        channels.0,
                        FrameRoute {
                            tx: self.tx.clone(),
                            media_idx,
                            rtcp: false,
                        },
                    );
                    routes.insert(
                        channels.1,
                        FrameRoute {
                            tx: self.tx.clone(),
                            media_idx,
                            rtcp: true,
                        },
                    );
                }
                self.frame_channels.push((ctx.clone(), channels.0));
                self.frame_channels.push((ctx.clone(), channels.1));

                setup.channels = Some(channels);
                setup.conn_writer = Some(ctx.writer.clone());

                res_th.protocol = crate::headers::TransportProtocol::Tcp;
                res_th.delivery = Some(Delivery::Unicast);
                res_th.interleaved = Some(channels);
            }
            TransportKind::UdpMulticast => {
                // record mode was rejected above, so a stream is present
                let Some(stream_ref) = stream.as_ref() else {
                    return self.reply(req, StatusCode::INTERNAL_SERVER_ERROR);
                };
                let binding = {
                    let group = match stream_ref.multicast_info() {
                        Some((group, _, _)) => group,
                        None => {
                            let mut alloc = self.inner.multicast_alloc.lock();
                            match alloc.as_mut().map(|a| a.allocate()) {
                                Some(Ok(g)) => g,
                                Some(Err(e)) => {
                                    log::warn!("session {}: {e}", self.id);
                                    return self
                                        .reply(req, StatusCode::INTERNAL_SERVER_ERROR);
                                }
                                None => {
                                    return self
                                        .reply(req, StatusCode::UNSUPPORTED_TRANSPORT);
                                }
                            }
                        }
                    };
                    stream_ref.multicast_binding(
                        group,
                        (
                            self.inner.multicast_rtp_port,
                            self.inner.multicast_rtcp_port,
                        ),
                        self.inner.multicast_ttl,
                        self.inner.write_queue_size,
                    )
                };
                let (group, ports, ttl) = match binding {
                    Ok(b) => b,
                    Err(e) => {
                        log::warn!("session {}: multicast bind failed: {e}", self.id);
                        return self.reply(req, StatusCode::INTERNAL_SERVER_ERROR);
                    }
                };

                res_th.delivery = Some(Delivery::Multicast);
                res_th.destination = Some(IpAddr::V4(group));
                res_th.port = Some(ports);
                res_th.ttl = Some(ttl);
            }
        }

        self.transport_kind = Some(kind);
        if stream.is_some() {
            self.stream = stream;
        }
        self.setups.push(setup);
        self.state = if record_mode {
            SessionState::PreRecord
        } else {
            SessionState::PreRead
        };

        let mut res = self.reply(req, StatusCode::OK);
        res.headers.set("Transport", res_th.to_string());
        res
    }

    fn handle_play(&mut self, req: &Request) -> Response {
        if self.state != SessionState::PreRead && self.state != SessionState::Read {
            return self.not_valid(req);
        }
        let Some(handler) = self.inner.handlers.play.clone() else {
            return self.reply(req, StatusCode::NOT_IMPLEMENTED);
        };
        let status = handler(&self.id);
        if !status.is_success() {
            return self.reply(req, status);
        }

        let Some(stream) = self.stream.clone() else {
            return self.reply(req, StatusCode::INTERNAL_SERVER_ERROR);
        };

        if self.state == SessionState::PreRead {
            let multicast = self.transport_kind == Some(TransportKind::UdpMulticast);
            let media_count = stream.description().medias.len();
            let mut writers: Vec<Option<MediaWriters>> = vec![None; media_count];
            if !multicast {
                for setup in &self.setups {
                    let w = match setup {
                        MediaSetup {
                            udp_rtp_writer: Some(rtp),
                            udp_rtcp_writer: Some(rtcp),
                            client_rtp_dest: Some(rtp_dest),
                            client_rtcp_dest: Some(rtcp_dest),
                            ..
                        } => MediaWriters::Udp {
                            rtp: rtp.clone(),
                            rtcp: rtcp.clone(),
                            rtp_dest: *rtp_dest,
                            rtcp_dest: *rtcp_dest,
                        },
                        MediaSetup {
                            conn_writer: Some(writer),
                            channels: Some(channels),
                            ..
                        } => MediaWriters::Tcp {
                            writer: writer.clone(),
                            rtp_channel: channels.0,
                            rtcp_channel: channels.1,
                        },
                        _ => continue,
                    };
                    writers[setup.media_idx] = Some(w);
                }
            }
            self.reader_slot = Some(stream.add_reader(writers, multicast));
        }

        self.state = SessionState::Read;

        let mut res = self.reply(req, StatusCode::OK);
        if let Some(range) = req.headers.get("Range") {
            res.headers.set("Range", range.to_owned());
        }

        // RTP-Info for every set-up media
        let mut entries = Vec::new();
        for setup in &self.setups {
            let (seq, rtptime) = stream.rtp_info(setup.media_idx);
            let token = stream.description().medias[setup.media_idx]
                .control
                .clone()
                .unwrap_or_default();
            entries.push(RtpInfoEntry {
                url: join_control_url(&req.url, &token),
                seq,
                rtptime,
            });
        }
        if !entries.is_empty() {
            res.headers.set("RTP-Info", RtpInfo(entries).to_string());
        }
        res
    }

    fn handle_record(&mut self, req: &Request) -> Response {
        if self.state != SessionState::PreRecord {
            return self.not_valid(req);
        }
        let Some(handler) = self.inner.handlers.record.clone() else {
            return self.reply(req, StatusCode::NOT_IMPLEMENTED);
        };
        let status = handler(&self.id);
        if !status.is_success() {
            return self.reply(req, status);
        }
        self.state = SessionState::Record;
        self.last_receiver_report = Instant::now();
        self.reply(req, StatusCode::OK)
    }

    fn handle_pause(&mut self, req: &Request) -> Response {
        let next = match self.state {
            SessionState::Read => SessionState::PreRead,
            SessionState::Record => SessionState::PreRecord,
            _ => return self.not_valid(req),
        };
        let Some(handler) = self.inner.handlers.pause.clone() else {
            return self.reply(req, StatusCode::NOT_IMPLEMENTED);
        };
        let status = handler(&self.id);
        if !status.is_success() {
            return self.reply(req, status);
        }

        if next == SessionState::PreRead {
            // halt delivery; the transport stays allocated for resume
            if let (Some(stream), Some(slot)) = (&self.stream, self.reader_slot.take()) {
                stream.remove_reader(slot);
            }
        }
        self.state = next;
        self.reply(req, StatusCode::OK)
    }

    fn handle_media_data(&mut self, media_idx: usize, rtcp: bool, data: Bytes) {
        self.touch();
        let Some(setup) = self.setups.iter().find(|s| s.media_idx == media_idx) else {
            return;
        };

        if rtcp {
            let data = match &mut self.srtp_in {
                Some(ctx) => match ctx.unprotect_rtcp(&data) {
                    Ok(d) => d,
                    Err(e) => {
                        self.report_decode_error("rtcp", &e);
                        return;
                    }
                },
                None => data,
            };
            let packets = match rtcp::RtcpPacket::unmarshal_compound(&data) {
                Ok(p) => p,
                Err(e) => {
                    self.report_decode_error("rtcp", &e);
                    return;
                }
            };
            let now = Instant::now();
            for packet in packets {
                if let rtcp::RtcpPacket::SenderReport(sr) = &packet {
                    setup.recv_stats.lock().process_sender_report(now, sr);
                }
                if let Some(cb) = &self.inner.handlers.packet_rtcp {
                    cb(&self.id, media_idx, packet);
                }
            }
            return;
        }

        // RTP: meaningful only while recording; dummy hole-punch datagrams
        // arrive here in Read state and are dropped
        if self.state != SessionState::Record {
            return;
        }

        let data = match &mut self.srtp_in {
            Some(ctx) => match ctx.unprotect_rtp(&data) {
                Ok(d) => d,
                Err(e) => {
                    self.report_decode_error("rtp", &e);
                    return;
                }
            },
            None => data,
        };

        let packet = match rtp::Packet::unmarshal(&mut data.clone()) {
            Ok(p) => p,
            Err(e) => {
                self.report_decode_error("rtp", &e);
                return;
            }
        };

        let ingest = match setup
            .recv_stats
            .lock()
            .process_rtp(Instant::now(), &packet.header)
        {
            Ok(i) => i,
            Err(e) => {
                self.report_decode_error("rtp", &e);
                return;
            }
        };
        if let (Some(lost), Some(cb)) = (ingest.lost_run, &self.inner.handlers.packet_lost) {
            cb(lost);
        }
        if let Some(cb) = &self.inner.handlers.packet_rtp {
            cb(
                &self.id,
                media_idx,
                packet.header.payload_type,
                packet,
            );
        }
    }

    fn report_decode_error(&self, context: &str, e: &Error) {
        log::debug!("session {}: {context} decode error: {e}", self.id);
        if let Some(cb) = &self.inner.handlers.decode_error {
            cb(context, e);
        }
    }

    fn emit_receiver_reports(&mut self) {
        let now = Instant::now();
        for setup in &self.setups {
            let Some(report) = setup.recv_stats.lock().generate_report(now) else {
                continue;
            };
            let Ok(raw) = report.marshal() else { continue };

            if let (Some(writer), Some(dest)) = (&setup.udp_rtcp_writer, setup.client_rtcp_dest)
            {
                if let Err(e) = writer.try_enqueue(raw, dest) {
                    log::debug!("session {}: receiver report send failed: {e}", self.id);
                }
            } else if let (Some(writer), Some(channels)) = (&setup.conn_writer, setup.channels) {
                let frame = Frame {
                    channel: channels.1,
                    payload: raw,
                };
                if let Ok(buf) = frame.marshal() {
                    if let Err(e) = writer.try_enqueue(buf) {
                        log::debug!("session {}: receiver report send failed: {e}", self.id);
                    }
                }
            }
        }
    }
}

/// Splits a request URL into decoded path and raw query.
pub(crate) fn split_path_query(raw_url: &str) -> (String, String) {
    match url::Url::parse(raw_url) {
        Ok(u) => (
            u.path().to_owned(),
            u.query().unwrap_or_default().to_owned(),
        ),
        Err(_) => (raw_url.to_owned(), String::new()),
    }
}

/// Removes a trailing control token (`/trackID=n`) so every SETUP of a
/// session resolves to the same canonical path.
pub(crate) fn strip_control_token(path: &str) -> String {
    match path.rfind('/') {
        Some(pos) if path[pos + 1..].contains('=') => path[..pos].to_owned(),
        _ => path.to_owned(),
    }
}

/// Appends a control token to a session URL, tolerating trailing slashes
/// and query-form tokens.
pub(crate) fn join_control_url(base: &str, token: &str) -> String {
    if token.starts_with("rtsp://") || token.starts_with("rtsps://") {
        return token.to_owned();
    }
    let base = base.trim_end_matches('/');
    if token.starts_with('?') {
        format!("{base}{token}")
    } else {
        format!("{base}/{token}")
    }
}

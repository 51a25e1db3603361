//! The RTSP client: dial, describe or announce, set up each media with
//! automatic transport fallback, play or record, keepalive, and redirect
//! handling.

mod media;

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use url::Url;

use sdp::{SessionDescription, TransportProfile};
use shared::error::{Error, Result};
use shared::marshal::Marshal;
use shared::time::ntp_encode;

pub use crate::auth::Credentials;
use crate::auth::ClientAuth;
use crate::conn::{ConnReader, ConnWriter, spawn_writer, split_stream};
use crate::headers::rtp_info::RtpInfo;
use crate::headers::transport::Delivery;
use crate::headers::{NptRange, SessionHeader, TransportHeader, TransportKind, TransportMode};
use crate::message::{
    DEFAULT_MAX_FRAME_LEN, Item, Method, Request, Response, StatusCode,
};
use crate::report::{DEFAULT_REPORT_PERIOD, ReceiverStats, SenderStats};
use crate::server::session::join_control_url;
use crate::udp::{
    BufferPool, SourceFilter, UdpWriter, bind_multicast, bind_udp_pair, punch_datagrams,
    spawn_udp_reader, spawn_udp_writer,
};

use media::{MediaIngest, MediaSetup};

pub type OnClientPacketRtp = Arc<dyn Fn(usize, u8, rtp::Packet) + Send + Sync>;
pub type OnClientPacketRtcp = Arc<dyn Fn(usize, rtcp::RtcpPacket) + Send + Sync>;
pub type OnClientDecodeError = Arc<dyn Fn(&str, &Error) + Send + Sync>;
pub type OnClientPacketLost = Arc<dyn Fn(u64) + Send + Sync>;
pub type OnTransportSwitch = Arc<dyn Fn(&str) + Send + Sync>;
pub type OnClientRequest = Arc<dyn Fn(&Request) + Send + Sync>;
pub type OnClientResponse = Arc<dyn Fn(&Response) + Send + Sync>;

/// Client configuration and callbacks. The defaults are production values;
/// the timing knobs exist mainly for tests.
#[derive(Clone)]
pub struct ClientOptions {
    /// Transport tried by the first SETUP. A 461 answer or UDP silence
    /// downgrades to TCP automatically.
    pub preferred_transport: TransportKind,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How long to wait for the first RTP packet after PLAY over UDP
    /// before tearing down and re-running the handshake over TCP.
    pub initial_udp_read_timeout: Duration,
    pub write_queue_size: usize,
    pub max_frame_len: usize,
    pub max_redirects: usize,
    pub report_period: Duration,
    /// Overrides the `max(30s, timeout - 5s)` keepalive schedule.
    pub keepalive_interval: Option<Duration>,
    pub any_port_enable: bool,
    pub user_agent: String,
    pub credentials: Option<Credentials>,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Accept any server certificate. For lab gear with self-signed
    /// certificates; never for the open internet.
    pub danger_accept_invalid_tls: bool,

    pub on_packet_rtp: Option<OnClientPacketRtp>,
    pub on_packet_rtcp: Option<OnClientPacketRtcp>,
    pub on_transport_switch: Option<OnTransportSwitch>,
    pub on_decode_error: Option<OnClientDecodeError>,
    pub on_packet_lost: Option<OnClientPacketLost>,
    pub on_request: Option<OnClientRequest>,
    pub on_response: Option<OnClientResponse>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            preferred_transport: TransportKind::UdpUnicast,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            initial_udp_read_timeout: Duration::from_secs(3),
            write_queue_size: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_redirects: 5,
            report_period: DEFAULT_REPORT_PERIOD,
            keepalive_interval: None,
            any_port_enable: false,
            user_agent: concat!("rtsp-rs/", env!("CARGO_PKG_VERSION")).to_owned(),
            credentials: None,
            tls_config: None,
            danger_accept_invalid_tls: false,
            on_packet_rtp: None,
            on_packet_rtcp: None,
            on_transport_switch: None,
            on_decode_error: None,
            on_packet_lost: None,
            on_request: None,
            on_response: None,
        }
    }
}

/// Connection state shared between the client, its reader task, and the
/// background keepalive/report tasks.
struct ClientConn {
    writer: ConnWriter,
    pending: Mutex<VecDeque<oneshot::Sender<Response>>>,
    cseq: AtomicU32,
    session_id: Mutex<Option<String>>,
    auth: Mutex<Option<ClientAuth>>,
    frame_sinks: Mutex<std::collections::HashMap<u8, Arc<dyn Fn(Bytes) + Send + Sync>>>,
    read_timeout: Duration,
    user_agent: String,
    on_request: Option<OnClientRequest>,
    on_response: Option<OnClientResponse>,
    closed: AtomicBool,
}

impl ClientConn {
    fn decorate(&self, req: &mut Request) {
        let cseq = self.cseq.fetch_add(1, Ordering::Relaxed);
        req.headers.set("CSeq", cseq.to_string());
        req.headers.set("User-Agent", self.user_agent.clone());
        if let Some(id) = self.session_id.lock().as_ref() {
            req.headers.set("Session", id.clone());
        }
        let mut auth = self.auth.lock();
        if let Some(auth) = auth.as_mut() {
            if let Some(value) = auth.authorization(req.method, &req.url) {
                req.headers.set("Authorization", value);
            }
        }
    }

    async fn roundtrip_once(&self, req: Request) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        if let Some(hook) = &self.on_request {
            hook(&req);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(tx);
        self.writer.enqueue(req.marshal()).await?;
        let res = tokio::time::timeout(self.read_timeout, rx)
            .await
            .map_err(|_| Error::IoTimeout("no response on control channel".to_owned()))?
            .map_err(|_| Error::Terminated)?;
        Ok(res)
    }

    /// Sends the request, transparently retrying once with credentials
    /// after a 401 challenge. A second 401 or any 403 is final.
    async fn roundtrip(&self, req: Request) -> Result<Response> {
        let mut authenticated_retry = false;
        loop {
            let mut attempt = req.clone();
            self.decorate(&mut attempt);
            let res = self.roundtrip_once(attempt).await?;
            match res.status {
                StatusCode::UNAUTHORIZED if !authenticated_retry => {
                    {
                        let mut auth = self.auth.lock();
                        match auth.as_mut() {
                            Some(a) => a.handle_unauthorized(&res)?,
                            None => return Err(Error::Unauthorized),
                        }
                    }
                    authenticated_retry = true;
                }
                StatusCode::UNAUTHORIZED => return Err(Error::Unauthorized),
                StatusCode::FORBIDDEN => return Err(Error::Forbidden),
                _ => {
                    // adopt the session id as soon as the server assigns one
                    if res.status.is_success() {
                        if let Some(raw) = res.headers.get("Session") {
                            if let Ok(header) = raw.parse::<SessionHeader>() {
                                let mut id = self.session_id.lock();
                                if id.is_none() {
                                    *id = Some(header.id);
                                }
                            }
                        }
                    }
                    return Ok(res);
                }
            }
        }
    }
}

fn expect_ok(res: Response) -> Result<Response> {
    if res.status.is_success() {
        Ok(res)
    } else {
        Err(Error::BadStatus(res.status.0, res.status.reason().to_owned()))
    }
}

async fn connect(
    url: &Url,
    options: &ClientOptions,
) -> Result<(Arc<ClientConn>, tokio::task::JoinHandle<()>, IpAddr)> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidUrl("missing host".to_owned()))?
        .to_owned();
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "rtsps" { 322 } else { 554 });

    let stream = tokio::time::timeout(options.read_timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| Error::IoTimeout(format!("connecting to {host}:{port}")))??;
    let _ = stream.set_nodelay(true);
    let server_ip = stream.peer_addr()?.ip();

    let (read_half, write_half) = if url.scheme() == "rtsps" {
        let config = match &options.tls_config {
            Some(c) => c.clone(),
            None if options.danger_accept_invalid_tls => insecure_tls_config(),
            None => {
                return Err(Error::InvalidUrl(
                    "rtsps requires a TLS client configuration".to_owned(),
                ));
            }
        };
        let connector = tokio_rustls::TlsConnector::from(config);
        let server_name = rustls::pki_types::ServerName::try_from(host.clone())
            .map_err(|_| Error::InvalidUrl(format!("bad TLS server name {host}")))?;
        let tls = connector.connect(server_name, stream).await?;
        split_stream(tls)
    } else {
        split_stream(stream)
    };

    let writer = spawn_writer(write_half, options.write_queue_size, options.write_timeout);
    let conn = Arc::new(ClientConn {
        writer,
        pending: Mutex::new(VecDeque::new()),
        cseq: AtomicU32::new(1),
        session_id: Mutex::new(None),
        auth: Mutex::new(options.credentials.clone().map(ClientAuth::new)),
        frame_sinks: Mutex::new(std::collections::HashMap::new()),
        read_timeout: options.read_timeout,
        user_agent: options.user_agent.clone(),
        on_request: options.on_request.clone(),
        on_response: options.on_response.clone(),
        closed: AtomicBool::new(false),
    });

    let reader = ConnReader::new(read_half, options.max_frame_len);
    let reader_task = tokio::spawn(run_reader(conn.clone(), reader));

    Ok((conn, reader_task, server_ip))
}

async fn run_reader(conn: Arc<ClientConn>, mut reader: ConnReader) {
    loop {
        match reader.next_item(None).await {
            Ok(Item::Response(res)) => {
                if let Some(hook) = &conn.on_response {
                    hook(&res);
                }
                if let Some(tx) = conn.pending.lock().pop_front() {
                    let _ = tx.send(res);
                } else {
                    log::debug!("response without a pending request, dropping");
                }
            }
            Ok(Item::Frame(frame)) => {
                let sink = conn.frame_sinks.lock().get(&frame.channel).cloned();
                match sink {
                    Some(sink) => sink(frame.payload),
                    None => log::debug!("frame on unknown channel {}", frame.channel),
                }
            }
            Ok(Item::Request(req)) => {
                // server-initiated keepalives
                let status = match req.method {
                    Method::Options | Method::GetParameter => StatusCode::OK,
                    _ => StatusCode::NOT_IMPLEMENTED,
                };
                let mut res = Response::new(status);
                if let Ok(cseq) = req.cseq() {
                    res.headers.set("CSeq", cseq.to_string());
                }
                let _ = conn.writer.try_enqueue(res.marshal());
            }
            Err(e) => {
                log::debug!("client connection closed: {e}");
                break;
            }
        }
    }
    conn.closed.store(true, Ordering::Release);
    // pending waiters observe Terminated when their sender drops
    conn.pending.lock().clear();
}

fn insecure_tls_config() -> Arc<rustls::ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    Arc::new(
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth(),
    )
}

/// Certificate verifier that accepts everything, for
/// [`ClientOptions::danger_accept_invalid_tls`].
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// An RTSP client session over one control connection.
pub struct Client {
    options: ClientOptions,
    url: Url,
    conn: Arc<ClientConn>,
    reader_task: tokio::task::JoinHandle<()>,
    server_ip: IpAddr,

    sdp: Option<SessionDescription>,
    base_url: String,
    setups: Vec<MediaSetup>,
    transport_kind: Option<TransportKind>,
    session_timeout: Duration,
    public: Vec<String>,
    next_channel: u8,
    recording: bool,
    /// Master key/salt generated for our own ANNOUNCE when it carried SAVP
    /// medias; the publish direction encrypts with it.
    announce_key: Option<([u8; srtp::MASTER_KEY_LEN], [u8; srtp::MASTER_SALT_LEN])>,
    rtp_info: Option<RtpInfo>,

    keepalive_task: Option<tokio::task::JoinHandle<()>>,
    report_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Client {
    /// Connects the control channel. `rtsp://` and `rtsps://` URLs are
    /// accepted; userinfo credentials take effect when the options carry
    /// none.
    pub async fn dial(raw_url: &str, mut options: ClientOptions) -> Result<Client> {
        let mut url =
            Url::parse(raw_url).map_err(|e| Error::InvalidUrl(format!("{raw_url}: {e}")))?;
        match url.scheme() {
            "rtsp" | "rtsps" => {}
            other => {
                return Err(Error::InvalidUrl(format!("unsupported scheme {other}")));
            }
        }

        if options.credentials.is_none() && !url.username().is_empty() {
            options.credentials = Some(Credentials {
                username: url.username().to_owned(),
                password: url.password().unwrap_or_default().to_owned(),
            });
        }
        let _ = url.set_username("");
        let _ = url.set_password(None);

        let (conn, reader_task, server_ip) = connect(&url, &options).await?;
        let base_url = url.as_str().trim_end_matches('/').to_owned();

        Ok(Client {
            options,
            url,
            conn,
            reader_task,
            server_ip,
            sdp: None,
            base_url,
            setups: Vec::new(),
            transport_kind: None,
            session_timeout: Duration::from_secs(60),
            public: Vec::new(),
            next_channel: 0,
            recording: false,
            announce_key: None,
            rtp_info: None,
            keepalive_task: None,
            report_tasks: Vec::new(),
        })
    }

    pub fn description(&self) -> Option<&SessionDescription> {
        self.sdp.as_ref()
    }

    /// The RTP-Info returned by the last PLAY, when the server sent one.
    pub fn play_info(&self) -> Option<&RtpInfo> {
        self.rtp_info.as_ref()
    }

    fn url_str(&self) -> String {
        self.base_url.clone()
    }

    /// OPTIONS; remembers the advertised `Public` methods so keepalive can
    /// prefer GET_PARAMETER.
    pub async fn options(&mut self) -> Result<Vec<String>> {
        let res = self
            .conn
            .roundtrip(Request::new(Method::Options, self.url_str()))
            .await?;
        let res = expect_ok(res)?;
        self.public = res
            .headers
            .get("Public")
            .map(|v| v.split(',').map(|m| m.trim().to_owned()).collect())
            .unwrap_or_default();
        Ok(self.public.clone())
    }

    /// DESCRIBE, following up to `max_redirects` 301 answers by re-dialing
    /// the Location and replaying from OPTIONS.
    pub async fn describe(&mut self) -> Result<&SessionDescription> {
        let mut redirects = 0;
        loop {
            let req = Request::new(Method::Describe, self.url_str())
                .with_header("Accept", "application/sdp");
            let res = self.conn.roundtrip(req).await?;

            if res.status == StatusCode::MOVED_PERMANENTLY {
                redirects += 1;
                if redirects > self.options.max_redirects {
                    return Err(Error::TooManyRedirects);
                }
                let location = res
                    .headers
                    .get("Location")
                    .ok_or_else(|| {
                        Error::Malformed("301 without Location header".to_owned())
                    })?
                    .to_owned();
                self.follow_redirect(&location).await?;
                continue;
            }

            let res = expect_ok(res)?;
            let body = std::str::from_utf8(&res.body)
                .map_err(|_| Error::Malformed("non-UTF-8 SDP".to_owned()))?;
            let description = SessionDescription::parse(body)?;

            // base URL precedence: Content-Base, absolute session control,
            // then the request URL
            self.base_url = if let Some(content_base) = res.headers.get("Content-Base") {
                content_base.trim_end_matches('/').to_owned()
            } else if let Some(control) = description
                .control
                .as_deref()
                .filter(|c| c.starts_with("rtsp://") || c.starts_with("rtsps://"))
            {
                control.trim_end_matches('/').to_owned()
            } else {
                self.url_str()
            };

            self.recording = false;
            return Ok(&*self.sdp.insert(description));
        }
    }

    async fn follow_redirect(&mut self, location: &str) -> Result<()> {
        let mut new_url = Url::parse(location)
            .map_err(|e| Error::InvalidUrl(format!("{location}: {e}")))?;
        // credentials carry over only when the host does not change
        if new_url.host_str() != self.url.host_str() {
            self.options.credentials = None;
        }
        let _ = new_url.set_username("");
        let _ = new_url.set_password(None);

        self.reader_task.abort();
        let (conn, reader_task, server_ip) = connect(&new_url, &self.options).await?;
        self.conn = conn;
        self.reader_task = reader_task;
        self.server_ip = server_ip;
        self.url = new_url;
        self.base_url = self.url.as_str().trim_end_matches('/').to_owned();
        self.setups.clear();
        self.next_channel = 0;
        self.transport_kind = None;

        self.options().await.map(|_| ())
    }

    /// ANNOUNCE a description for recording. SAVP medias that carry no
    /// key management get a fresh MIKEY blob generated here.
    pub async fn announce(&mut self, mut description: SessionDescription) -> Result<()> {
        description.prepare()?;

        let mut srtp_out_key: Option<([u8; srtp::MASTER_KEY_LEN], [u8; srtp::MASTER_SALT_LEN])> =
            None;
        if description
            .medias
            .iter()
            .any(|m| m.profile == TransportProfile::Savp && m.key_mgmt.is_none())
        {
            let key: [u8; srtp::MASTER_KEY_LEN] = rand::random();
            let salt: [u8; srtp::MASTER_SALT_LEN] = rand::random();
            let mikey = srtp::MikeyMessage::new(
                rand::random(),
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
            srtp_out_key = Some((key, salt));
        }

        let req = Request::new(Method::Announce, self.url_str())
            .with_body("application/sdp", description.marshal());
        let res = self.conn.roundtrip(req).await?;
        expect_ok(res)?;

        self.sdp = Some(description);
        self.recording = true;
        self.announce_key = srtp_out_key;
        Ok(())
    }

    /// SETUP one media, automatically downgrading to TCP-interleaved when
    /// the server answers 461.
    pub async fn setup(&mut self, media_idx: usize) -> Result<()> {
        let description = self
            .sdp
            .as_ref()
            .ok_or_else(|| Error::BadRequest("no session description".to_owned()))?;
        let media = description
            .medias
            .get(media_idx)
            .ok_or_else(|| Error::BadRequest(format!("no media {media_idx}")))?
            .clone();
        if self.setups.iter().any(|s| s.media_idx == media_idx) {
            return Err(Error::BadRequest(format!("media {media_idx} already set up")));
        }

        let control_url = join_control_url(
            &self.base_url,
            media.control.as_deref().unwrap_or_default(),
        );
        let clock_rate = media
            .formats
            .first()
            .map(|f| f.clock_rate)
            .unwrap_or(90000);
        let secure = media.profile == TransportProfile::Savp;

        let mut kind = self
            .transport_kind
            .unwrap_or(self.options.preferred_transport);

        // subscriber MIKEY answer: keys the RTCP we send back to the server
        let subscriber_key: Option<([u8; srtp::MASTER_KEY_LEN], [u8; srtp::MASTER_SALT_LEN], String)> =
            if secure && !self.recording {
                let key: [u8; srtp::MASTER_KEY_LEN] = rand::random();
                let salt: [u8; srtp::MASTER_SALT_LEN] = rand::random();
                let mikey = srtp::MikeyMessage::new(
                    rand::random(),
                    ntp_encode(SystemTime::now()),
                    &key,
                    &salt,
                )?;
                use base64::Engine as _;
                let b64 = base64::engine::general_purpose::STANDARD.encode(mikey.marshal());
                Some((key, salt, b64))
            } else {
                None
            };

        loop {
            let mut th = TransportHeader {
                secure,
                ..Default::default()
            };
            let mut udp_pair = None;
            let mut channels = None;
            match kind {
                TransportKind::UdpUnicast => {
                    let pair = bind_udp_pair(unspecified_ip(self.server_ip)).await?;
                    th.delivery = Some(Delivery::Unicast);
                    th.client_port = Some((pair.rtp_port, pair.rtcp_port));
                    udp_pair = Some(pair);
                }
                TransportKind::UdpMulticast => {
                    th.delivery = Some(Delivery::Multicast);
                }
                TransportKind::TcpInterleaved => {
                    let pair = (self.next_channel, self.next_channel + 1);
                    th.protocol = crate::headers::TransportProtocol::Tcp;
                    th.delivery = Some(Delivery::Unicast);
                    th.interleaved = Some(pair);
                    channels = Some(pair);
                }
            }
            if self.recording {
                th.mode = Some(TransportMode::Record);
            }

            let mut req = Request::new(Method::Setup, control_url.clone())
                .with_header("Transport", th.to_string());
            if let Some((_, _, b64)) = &subscriber_key {
                req = req.with_header("KeyMgmt", format!("mikey {b64}"));
            }

            let res = self.conn.roundtrip(req).await?;
            if res.status == StatusCode::UNSUPPORTED_TRANSPORT
                && kind != TransportKind::TcpInterleaved
            {
                log::debug!("media {media_idx}: server rejected {kind}, retrying over TCP");
                if let Some(cb) = &self.options.on_transport_switch {
                    cb("switching to TCP because server requested it");
                }
                kind = TransportKind::TcpInterleaved;
                self.transport_kind = Some(kind);
                continue;
            }
            let res = expect_ok(res)?;

            // session id and timeout from the Session header
            if let Some(raw) = res.headers.get("Session") {
                let header: SessionHeader = raw.parse()?;
                if let Some(timeout) = header.timeout {
                    self.session_timeout = Duration::from_secs(timeout);
                }
                *self.conn.session_id.lock() = Some(header.id);
            }

            let res_th: TransportHeader = res
                .headers
                .get("Transport")
                .ok_or_else(|| {
                    Error::MalformedHeader("Transport".to_owned(), "missing".to_owned())
                })?
                .parse()?;

            let subscriber = subscriber_key
                .as_ref()
                .map(|(key, salt, _)| (&key[..], &salt[..]));
            let ingest = Arc::new(self.build_ingest(media_idx, clock_rate, &media, subscriber)?);
            let mut setup = MediaSetup {
                media_idx,
                kind,
                control_url: control_url.clone(),
                ingest: ingest.clone(),
                udp: None,
                udp_rtp_writer: None,
                udp_rtcp_writer: None,
                server_rtp_dest: None,
                server_rtcp_dest: None,
                udp_tasks: Vec::new(),
                channels: None,
            };

            match kind {
                TransportKind::UdpUnicast => {
                    let pair = udp_pair.take().ok_or(Error::Terminated)?;
                    let server_ports = res_th.server_port;
                    let source_ip = res_th.source.unwrap_or(self.server_ip);

                    let pool = BufferPool::new();
                    for (socket, port, is_rtcp) in [
                        (pair.rtp.clone(), server_ports.map(|p| p.0), false),
                        (pair.rtcp.clone(), server_ports.map(|p| p.1), true),
                    ] {
                        let filter = SourceFilter::new(
                            source_ip,
                            port,
                            self.options.any_port_enable || port.is_none(),
                        );
                        let ingest = ingest.clone();
                        setup.udp_tasks.push(spawn_udp_reader(
                            socket,
                            filter,
                            pool.clone(),
                            Arc::new(move |data| {
                                if is_rtcp {
                                    ingest.handle_rtcp(data);
                                } else {
                                    ingest.handle_rtp(data);
                                }
                            }),
                        ));
                    }

                    setup.udp_rtp_writer =
                        Some(spawn_udp_writer(pair.rtp.clone(), self.options.write_queue_size));
                    setup.udp_rtcp_writer = Some(spawn_udp_writer(
                        pair.rtcp.clone(),
                        self.options.write_queue_size,
                    ));
                    if let Some(ports) = server_ports {
                        setup.server_rtp_dest = Some(SocketAddr::new(source_ip, ports.0));
                        setup.server_rtcp_dest = Some(SocketAddr::new(source_ip, ports.1));
                    }
                    setup.udp = Some(pair);
                }
                TransportKind::UdpMulticast => {
                    let group = match res_th.destination {
                        Some(IpAddr::V4(g)) if g.is_multicast() => g,
                        _ => {
                            return Err(Error::MalformedHeader(
                                "Transport".to_owned(),
                                "multicast without destination".to_owned(),
                            ));
                        }
                    };
                    let ports = res_th.port.ok_or_else(|| {
                        Error::MalformedHeader(
                            "Transport".to_owned(),
                            "multicast without port".to_owned(),
                        )
                    })?;
                    let ttl = res_th.ttl.unwrap_or(16) as u32;

                    let rtp_socket = bind_multicast(group, ports.0, ttl)?;
                    let rtcp_socket = bind_multicast(group, ports.1, ttl)?;
                    let pool = BufferPool::new();
                    for (socket, is_rtcp) in [(rtp_socket, false), (rtcp_socket, true)] {
                        let filter = SourceFilter::new(self.server_ip, None, true);
                        let ingest = ingest.clone();
                        setup.udp_tasks.push(spawn_udp_reader(
                            socket,
                            filter,
                            pool.clone(),
                            Arc::new(move |data| {
                                if is_rtcp {
                                    ingest.handle_rtcp(data);
                                } else {
                                    ingest.handle_rtp(data);
                                }
                            }),
                        ));
                    }
                }
                TransportKind::TcpInterleaved => {
                    let pair = res_th.interleaved.or(channels).ok_or_else(|| {
                        Error::MalformedHeader(
                            "Transport".to_owned(),
                            "interleaved channels missing".to_owned(),
                        )
                    })?;
                    setup.channels = Some(pair);
                    self.next_channel = self.next_channel.max(pair.1 + 1);

                    let mut sinks = self.conn.frame_sinks.lock();
                    let rtp_ingest = ingest.clone();
                    sinks.insert(
                        pair.0,
                        Arc::new(move |data| rtp_ingest.handle_rtp(data)),
                    );
                    let rtcp_ingest = ingest.clone();
                    sinks.insert(
                        pair.1,
                        Arc::new(move |data| rtcp_ingest.handle_rtcp(data)),
                    );
                }
            }

            self.transport_kind = Some(kind);
            self.setups.push(setup);
            return Ok(());
        }
    }

    fn build_ingest(
        &self,
        media_idx: usize,
        clock_rate: u32,
        media: &sdp::MediaDescription,
        subscriber_key: Option<(&[u8], &[u8])>,
    ) -> Result<MediaIngest> {
        // decrypt context from the publisher's MIKEY blob
        let srtp_in = match media
            .key_mgmt
            .as_ref()
            .or(self.sdp.as_ref().and_then(|d| d.key_mgmt.as_ref()))
        {
            Some(blob) if !self.recording => {
                let mikey = srtp::MikeyMessage::parse(blob)?;
                Some(Mutex::new(srtp::Context::new(&mikey.tek, &mikey.salt)?))
            }
            _ => None,
        };
        // encrypt context: recording reuses the announced key, playback the
        // subscriber answer key
        let srtp_out = match (&self.announce_key, self.recording, subscriber_key) {
            (Some((key, salt)), true, _) => Some(Mutex::new(srtp::Context::new(key, salt)?)),
            (_, false, Some((key, salt))) => Some(Mutex::new(srtp::Context::new(key, salt)?)),
            _ => None,
        };

        Ok(MediaIngest {
            media_idx,
            recv_stats: Mutex::new(ReceiverStats::new(clock_rate, rand::random())),
            send_stats: Mutex::new(SenderStats::new(clock_rate)),
            srtp_in,
            srtp_out,
            got_rtp: AtomicBool::new(false),
            on_packet_rtp: self.options.on_packet_rtp.clone(),
            on_packet_rtcp: self.options.on_packet_rtcp.clone(),
            on_decode_error: self.options.on_decode_error.clone(),
            on_packet_lost: self.options.on_packet_lost.clone(),
        })
    }

    /// Sets up every media of the current description.
    pub async fn setup_all(&mut self) -> Result<()> {
        let count = self
            .sdp
            .as_ref()
            .map(|d| d.medias.len())
            .ok_or_else(|| Error::BadRequest("no session description".to_owned()))?;
        for i in 0..count {
            self.setup(i).await?;
        }
        Ok(())
    }

    /// PLAY. Over UDP, waits for the first RTP packet; persistent silence
    /// tears the session down and re-runs the whole handshake over TCP.
    pub async fn play(&mut self, range: Option<NptRange>) -> Result<()> {
        self.play_inner(range).await?;

        if self.transport_kind == Some(TransportKind::UdpUnicast)
            && !self.wait_for_rtp(self.options.initial_udp_read_timeout).await
        {
            log::debug!("no RTP within {:?}, downgrading to TCP", self.options.initial_udp_read_timeout);
            if let Some(cb) = &self.options.on_transport_switch {
                cb("no UDP packets received, switching to TCP");
            }
            self.redial_over_tcp(range).await?;
        }
        Ok(())
    }

    async fn play_inner(&mut self, range: Option<NptRange>) -> Result<()> {
        let mut req = Request::new(Method::Play, self.url_str());
        if let Some(range) = range {
            req.headers.set("Range", range.to_string());
        }
        let res = self.conn.roundtrip(req).await?;
        let res = expect_ok(res)?;
        self.rtp_info = match res.headers.get("RTP-Info") {
            Some(v) => v.parse().ok(),
            None => None,
        };

        // open symmetric-NAT mappings toward the server ports
        let (punch_rtp, punch_rtcp) = punch_datagrams();
        for setup in &self.setups {
            if let (Some(writer), Some(dest)) = (&setup.udp_rtp_writer, setup.server_rtp_dest) {
                let _ = writer.try_enqueue(punch_rtp.clone(), dest);
            }
            if let (Some(writer), Some(dest)) =
                (&setup.udp_rtcp_writer, setup.server_rtcp_dest)
            {
                let _ = writer.try_enqueue(punch_rtcp.clone(), dest);
            }
        }

        self.start_keepalive();
        self.start_receiver_reports();
        Ok(())
    }

    async fn wait_for_rtp(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self
                .setups
                .iter()
                .any(|s| s.ingest.got_rtp.load(Ordering::Acquire))
            {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Tears everything down and repeats the whole handshake with
    /// TCP-interleaved transport, re-setting-up the same medias.
    async fn redial_over_tcp(&mut self, range: Option<NptRange>) -> Result<()> {
        let media_indices: Vec<usize> = self.setups.iter().map(|s| s.media_idx).collect();

        let _ = self.teardown().await;
        self.reader_task.abort();

        let (conn, reader_task, server_ip) = connect(&self.url, &self.options).await?;
        self.conn = conn;
        self.reader_task = reader_task;
        self.server_ip = server_ip;
        self.base_url = self.url.as_str().trim_end_matches('/').to_owned();
        self.transport_kind = Some(TransportKind::TcpInterleaved);
        self.next_channel = 0;

        self.options().await?;
        self.describe().await?;
        for media_idx in media_indices {
            self.setup(media_idx).await?;
        }
        self.play_inner(range).await
    }

    /// RECORD; afterwards the application feeds media with
    /// [`write_packet`](Client::write_packet).
    pub async fn record(&mut self) -> Result<()> {
        let res = self
            .conn
            .roundtrip(Request::new(Method::Record, self.url_str()))
            .await?;
        expect_ok(res)?;
        self.start_keepalive();
        self.start_sender_reports();
        Ok(())
    }

    /// PAUSE. Media delivery stops; the transport stays up for resume.
    pub async fn pause(&mut self) -> Result<()> {
        let res = self
            .conn
            .roundtrip(Request::new(Method::Pause, self.url_str()))
            .await?;
        expect_ok(res)?;
        self.stop_report_tasks();
        Ok(())
    }

    /// TEARDOWN and release of every socket and background task.
    pub async fn teardown(&mut self) -> Result<()> {
        let result = match self
            .conn
            .roundtrip(Request::new(Method::Teardown, self.url_str()))
            .await
        {
            Ok(res) => expect_ok(res).map(|_| ()),
            Err(e) => Err(e),
        };

        self.stop_report_tasks();
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
        for setup in &self.setups {
            setup.abort_tasks();
        }
        self.conn.frame_sinks.lock().clear();
        self.setups.clear();
        *self.conn.session_id.lock() = None;
        self.rtp_info = None;

        result
    }

    /// Writes one RTP packet on a set-up media while recording.
    pub fn write_packet(&self, media_idx: usize, packet: &rtp::Packet) -> Result<()> {
        let setup = self
            .setups
            .iter()
            .find(|s| s.media_idx == media_idx)
            .ok_or_else(|| Error::BadRequest(format!("media {media_idx} not set up")))?;

        let raw = packet.marshal()?;
        let raw = match &setup.ingest.srtp_out {
            Some(ctx) => ctx.lock().protect_rtp(&raw)?,
            None => raw,
        };

        setup.ingest.send_stats.lock().process_rtp(
            Instant::now(),
            &packet.header,
            packet.payload.len(),
        );

        if let (Some(writer), Some(dest)) = (&setup.udp_rtp_writer, setup.server_rtp_dest) {
            writer.try_enqueue(raw, dest)
        } else if let Some(channels) = setup.channels {
            let frame = crate::message::Frame {
                channel: channels.0,
                payload: raw,
            };
            self.conn.writer.try_enqueue(frame.marshal()?)
        } else {
            Err(Error::BadRequest(format!("media {media_idx} has no write path")))
        }
    }

    /// Pins the wallclock/RTP mapping advertised in this media's sender
    /// reports while recording.
    pub fn set_ntp_rtp(&self, media_idx: usize, wallclock: SystemTime, rtp_time: u32) {
        if let Some(setup) = self.setups.iter().find(|s| s.media_idx == media_idx) {
            setup.ingest.send_stats.lock().set_ntp_rtp(wallclock, rtp_time);
        }
    }

    fn keepalive_schedule(&self) -> Duration {
        match self.options.keepalive_interval {
            Some(d) => d,
            None => {
                let timeout = self.session_timeout;
                let margin = timeout.saturating_sub(Duration::from_secs(5));
                margin.max(Duration::from_secs(30))
            }
        }
    }

    fn start_keepalive(&mut self) {
        if self.keepalive_task.is_some() {
            return;
        }
        let method = if self.public.iter().any(|m| m == "GET_PARAMETER") {
            Method::GetParameter
        } else {
            Method::Options
        };
        let conn = self.conn.clone();
        let url = self.url_str();
        let interval = self.keepalive_schedule();
        self.keepalive_task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if conn.closed.load(Ordering::Acquire) {
                    return;
                }
                match conn.roundtrip(Request::new(method, url.clone())).await {
                    Ok(res) if res.status.is_success() => {}
                    Ok(res) => {
                        log::debug!("keepalive answered {}", res.status);
                        return;
                    }
                    Err(e) => {
                        log::debug!("keepalive failed: {e}");
                        return;
                    }
                }
            }
        }));
    }

    fn start_receiver_reports(&mut self) {
        let period = self.options.report_period;
        for setup in &self.setups {
            let ingest = setup.ingest.clone();
            let rtcp_writer = setup.udp_rtcp_writer.clone();
            let rtcp_dest = setup.server_rtcp_dest;
            let conn_writer = self.conn.writer.clone();
            let channels = setup.channels;
            self.report_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let report = ingest.recv_stats.lock().generate_report(Instant::now());
                    let Some(report) = report else { continue };
                    let Ok(raw) = report.marshal() else { continue };
                    let raw = match &ingest.srtp_out {
                        Some(ctx) => match ctx.lock().protect_rtcp(&raw) {
                            Ok(r) => r,
                            Err(_) => continue,
                        },
                        None => raw,
                    };
                    send_rtcp(&rtcp_writer, rtcp_dest, &conn_writer, channels, raw);
                }
            }));
        }
    }

    fn start_sender_reports(&mut self) {
        let period = self.options.report_period;
        for setup in &self.setups {
            let ingest = setup.ingest.clone();
            let rtcp_writer = setup.udp_rtcp_writer.clone();
            let rtcp_dest = setup.server_rtcp_dest;
            let conn_writer = self.conn.writer.clone();
            let channels = setup.channels;
            self.report_tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let report = ingest.send_stats.lock().generate_report(Instant::now());
                    let Some(report) = report else { continue };
                    let Ok(raw) = report.marshal() else { continue };
                    let raw = match &ingest.srtp_out {
                        Some(ctx) => match ctx.lock().protect_rtcp(&raw) {
                            Ok(r) => r,
                            Err(_) => continue,
                        },
                        None => raw,
                    };
                    send_rtcp(&rtcp_writer, rtcp_dest, &conn_writer, channels, raw);
                }
            }));
        }
    }

    fn stop_report_tasks(&mut self) {
        for task in self.report_tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
        }
        for task in self.report_tasks.drain(..) {
            task.abort();
        }
        for setup in &self.setups {
            setup.abort_tasks();
        }
    }
}

fn send_rtcp(
    udp_writer: &Option<UdpWriter>,
    udp_dest: Option<SocketAddr>,
    conn_writer: &ConnWriter,
    channels: Option<(u8, u8)>,
    raw: Bytes,
) {
    if let (Some(writer), Some(dest)) = (udp_writer, udp_dest) {
        if let Err(e) = writer.try_enqueue(raw, dest) {
            log::debug!("rtcp send failed: {e}");
        }
    } else if let Some(channels) = channels {
        let frame = crate::message::Frame {
            channel: channels.1,
            payload: raw,
        };
        match frame.marshal() {
            Ok(buf) => {
                if let Err(e) = conn_writer.try_enqueue(buf) {
                    log::debug!("rtcp send failed: {e}");
                }
            }
            Err(e) => log::debug!("rtcp frame marshal failed: {e}"),
        }
    }
}

fn unspecified_ip(peer: IpAddr) -> IpAddr {
    match peer {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED),
    }
}

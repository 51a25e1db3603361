//! The RTSP server: accept loop, optional TLS handshake, request routing,
//! session registry, and the multicast group allocator.

mod multicast;
pub(crate) mod session;
mod stream;

pub use stream::ServerStream;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use sdp::SessionDescription;
use shared::error::{Error, Result};
use shared::util::{generate_nonce, generate_session_id};

use crate::auth::Authenticator;
use crate::conn::{ConnReader, ConnWriter, spawn_writer, split_stream};
use crate::headers::{SessionHeader, TransportKind};
use crate::message::{
    DEFAULT_MAX_FRAME_LEN, Item, Method, Request, Response, StatusCode,
};
use crate::report::DEFAULT_REPORT_PERIOD;
use crate::server::multicast::MulticastAllocator;
use crate::server::session::{SessionCmd, split_path_query};

/// What the describe handler returns: a status plus, on success, the
/// stream whose description becomes the response body.
pub struct DescribeAnswer {
    pub status: StatusCode,
    pub stream: Option<Arc<ServerStream>>,
}

/// What the setup handler returns for play-mode SETUP.
pub struct SetupAnswer {
    pub status: StatusCode,
    pub stream: Option<Arc<ServerStream>>,
}

pub type OnDescribe = Arc<dyn Fn(&str, &str) -> DescribeAnswer + Send + Sync>;
pub type OnAnnounce = Arc<dyn Fn(&str, &str, &SessionDescription) -> StatusCode + Send + Sync>;
pub type OnSetup = Arc<dyn Fn(&str, &str, TransportKind) -> SetupAnswer + Send + Sync>;
pub type OnSessionHook = Arc<dyn Fn(&str) -> StatusCode + Send + Sync>;
pub type OnPacketRtp = Arc<dyn Fn(&str, usize, u8, rtp::Packet) + Send + Sync>;
pub type OnPacketRtcp = Arc<dyn Fn(&str, usize, rtcp::RtcpPacket) + Send + Sync>;
pub type OnDecodeError = Arc<dyn Fn(&str, &Error) + Send + Sync>;
pub type OnPacketLost = Arc<dyn Fn(u64) + Send + Sync>;
pub type OnRequestHook = Arc<dyn Fn(&Request) + Send + Sync>;
pub type OnResponseHook = Arc<dyn Fn(&Response) + Send + Sync>;

/// The capability set supplied by the application. `OPTIONS` advertises
/// exactly the methods that have handlers; the rest answer 501.
#[derive(Default, Clone)]
pub(crate) struct Handlers {
    pub(crate) describe: Option<OnDescribe>,
    pub(crate) announce: Option<OnAnnounce>,
    pub(crate) setup: Option<OnSetup>,
    pub(crate) play: Option<OnSessionHook>,
    pub(crate) record: Option<OnSessionHook>,
    pub(crate) pause: Option<OnSessionHook>,
    pub(crate) packet_rtp: Option<OnPacketRtp>,
    pub(crate) packet_rtcp: Option<OnPacketRtcp>,
    pub(crate) decode_error: Option<OnDecodeError>,
    pub(crate) packet_lost: Option<OnPacketLost>,
    pub(crate) request: Option<OnRequestHook>,
    pub(crate) response: Option<OnResponseHook>,
}

/// Builder for [`Server`]. Field defaults match common RTSP deployments;
/// the timing knobs exist mainly for tests.
pub struct ServerBuilder {
    listen_addr: String,
    tls: Option<(PathBuf, PathBuf)>,
    read_timeout: Duration,
    write_timeout: Duration,
    session_timeout: Duration,
    report_period: Duration,
    write_queue_size: usize,
    max_frame_len: usize,
    udp_enable: bool,
    multicast_enable: bool,
    multicast_cidr: String,
    multicast_rtp_port: u16,
    multicast_rtcp_port: u16,
    multicast_ttl: u8,
    any_port_enable: bool,
    srtp_mandatory: bool,
    authenticator: Option<Authenticator>,
    handlers: Handlers,
}

impl ServerBuilder {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            tls: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            report_period: DEFAULT_REPORT_PERIOD,
            write_queue_size: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            udp_enable: true,
            multicast_enable: false,
            multicast_cidr: "239.64.0.0/16".to_owned(),
            multicast_rtp_port: 6000,
            multicast_rtcp_port: 6001,
            multicast_ttl: 16,
            any_port_enable: false,
            srtp_mandatory: false,
            authenticator: None,
            handlers: Handlers::default(),
        }
    }

    /// Serves `rtsps` with the given PEM certificate chain and private key.
    pub fn tls(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.tls = Some((cert.into(), key.into()));
        self
    }

    pub fn read_timeout(mut self, d: Duration) -> Self {
        self.read_timeout = d;
        self
    }

    pub fn write_timeout(mut self, d: Duration) -> Self {
        self.write_timeout = d;
        self
    }

    pub fn session_timeout(mut self, d: Duration) -> Self {
        self.session_timeout = d;
        self
    }

    pub fn report_period(mut self, d: Duration) -> Self {
        self.report_period = d;
        self
    }

    pub fn write_queue_size(mut self, n: usize) -> Self {
        self.write_queue_size = n;
        self
    }

    pub fn max_frame_len(mut self, n: usize) -> Self {
        self.max_frame_len = n;
        self
    }

    pub fn udp(mut self, enable: bool) -> Self {
        self.udp_enable = enable;
        self
    }

    pub fn multicast(mut self, enable: bool) -> Self {
        self.multicast_enable = enable;
        self
    }

    pub fn multicast_cidr(mut self, cidr: impl Into<String>) -> Self {
        self.multicast_cidr = cidr.into();
        self
    }

    pub fn multicast_ports(mut self, rtp: u16, rtcp: u16) -> Self {
        self.multicast_rtp_port = rtp;
        self.multicast_rtcp_port = rtcp;
        self
    }

    pub fn multicast_ttl(mut self, ttl: u8) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    pub fn any_port(mut self, enable: bool) -> Self {
        self.any_port_enable = enable;
        self
    }

    /// Refuse plain-RTP SETUP: only SAVP transports are accepted.
    pub fn srtp_mandatory(mut self, enable: bool) -> Self {
        self.srtp_mandatory = enable;
        self
    }

    pub fn authenticator(mut self, a: Authenticator) -> Self {
        self.authenticator = Some(a);
        self
    }

    pub fn on_describe(
        mut self,
        f: impl Fn(&str, &str) -> DescribeAnswer + Send + Sync + 'static,
    ) -> Self {
        self.handlers.describe = Some(Arc::new(f));
        self
    }

    pub fn on_announce(
        mut self,
        f: impl Fn(&str, &str, &SessionDescription) -> StatusCode + Send + Sync + 'static,
    ) -> Self {
        self.handlers.announce = Some(Arc::new(f));
        self
    }

    pub fn on_setup(
        mut self,
        f: impl Fn(&str, &str, TransportKind) -> SetupAnswer + Send + Sync + 'static,
    ) -> Self {
        self.handlers.setup = Some(Arc::new(f));
        self
    }

    pub fn on_play(mut self, f: impl Fn(&str) -> StatusCode + Send + Sync + 'static) -> Self {
        self.handlers.play = Some(Arc::new(f));
        self
    }

    pub fn on_record(mut self, f: impl Fn(&str) -> StatusCode + Send + Sync + 'static) -> Self {
        self.handlers.record = Some(Arc::new(f));
        self
    }

    pub fn on_pause(mut self, f: impl Fn(&str) -> StatusCode + Send + Sync + 'static) -> Self {
        self.handlers.pause = Some(Arc::new(f));
        self
    }

    pub fn on_packet_rtp(
        mut self,
        f: impl Fn(&str, usize, u8, rtp::Packet) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.packet_rtp = Some(Arc::new(f));
        self
    }

    pub fn on_packet_rtcp(
        mut self,
        f: impl Fn(&str, usize, rtcp::RtcpPacket) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.packet_rtcp = Some(Arc::new(f));
        self
    }

    pub fn on_decode_error(
        mut self,
        f: impl Fn(&str, &Error) + Send + Sync + 'static,
    ) -> Self {
        self.handlers.decode_error = Some(Arc::new(f));
        self
    }

    pub fn on_packet_lost(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.handlers.packet_lost = Some(Arc::new(f));
        self
    }

    pub fn on_request(mut self, f: impl Fn(&Request) + Send + Sync + 'static) -> Self {
        self.handlers.request = Some(Arc::new(f));
        self
    }

    pub fn on_response(mut self, f: impl Fn(&Response) + Send + Sync + 'static) -> Self {
        self.handlers.response = Some(Arc::new(f));
        self
    }

    /// Binds the listener and constructs the server.
    pub async fn bind(self) -> Result<Server> {
        let listener = TcpListener::bind(&self.listen_addr).await?;

        let tls = match &self.tls {
            Some((cert_path, key_path)) => Some(load_tls_acceptor(cert_path, key_path)?),
            None => None,
        };
        let multicast_alloc = if self.multicast_enable {
            Some(MulticastAllocator::new(&self.multicast_cidr)?)
        } else {
            None
        };

        let inner = Arc::new(ServerInner {
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            session_timeout: self.session_timeout,
            report_period: self.report_period,
            write_queue_size: self.write_queue_size,
            max_frame_len: self.max_frame_len,
            udp_enable: self.udp_enable,
            multicast_enable: self.multicast_enable,
            multicast_rtp_port: self.multicast_rtp_port,
            multicast_rtcp_port: self.multicast_rtcp_port,
            multicast_ttl: self.multicast_ttl,
            any_port_enable: self.any_port_enable,
            srtp_mandatory: self.srtp_mandatory,
            authenticator: self.authenticator,
            handlers: self.handlers,
            registry: Registry {
                sessions: RwLock::new(HashMap::new()),
                udp_bindings: Mutex::new(HashSet::new()),
            },
            multicast_alloc: Mutex::new(multicast_alloc),
            tls,
            next_conn_id: AtomicU64::new(1),
        });

        Ok(Server { inner, listener })
    }
}

pub(crate) struct Registry {
    pub(crate) sessions: RwLock<HashMap<String, SessionHandle>>,
    /// `(client ip, client rtp port)` of every UDP session, to reject
    /// ambiguous re-binds.
    pub(crate) udp_bindings: Mutex<HashSet<(IpAddr, u16)>>,
}

#[derive(Clone)]
pub(crate) struct SessionHandle {
    pub(crate) id: String,
    pub(crate) tx: mpsc::Sender<SessionCmd>,
}

pub(crate) struct ServerInner {
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) session_timeout: Duration,
    pub(crate) report_period: Duration,
    pub(crate) write_queue_size: usize,
    pub(crate) max_frame_len: usize,
    pub(crate) udp_enable: bool,
    pub(crate) multicast_enable: bool,
    pub(crate) multicast_rtp_port: u16,
    pub(crate) multicast_rtcp_port: u16,
    pub(crate) multicast_ttl: u8,
    pub(crate) any_port_enable: bool,
    pub(crate) srtp_mandatory: bool,
    pub(crate) authenticator: Option<Authenticator>,
    pub(crate) handlers: Handlers,
    pub(crate) registry: Registry,
    pub(crate) multicast_alloc: Mutex<Option<MulticastAllocator>>,
    pub(crate) tls: Option<tokio_rustls::TlsAcceptor>,
    next_conn_id: AtomicU64,
}

/// Routing context of one control connection, shared with the sessions it
/// talks to.
#[derive(Clone)]
pub(crate) struct ConnCtx {
    pub(crate) conn_id: u64,
    pub(crate) remote_ip: IpAddr,
    pub(crate) writer: ConnWriter,
    pub(crate) frame_routes: FrameRoutes,
}

pub(crate) type FrameRoutes = Arc<Mutex<HashMap<u8, FrameRoute>>>;

#[derive(Clone)]
pub(crate) struct FrameRoute {
    pub(crate) tx: mpsc::Sender<SessionCmd>,
    pub(crate) media_idx: usize,
    pub(crate) rtcp: bool,
}

/// A bound RTSP server. `run` accepts connections until the listener
/// fails or the future is dropped.
pub struct Server {
    inner: Arc<ServerInner>,
    listener: TcpListener,
}

impl Server {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, remote) = self.listener.accept().await?;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = run_conn(inner, stream, remote).await {
                    log::debug!("connection {remote}: closed: {e}");
                }
            });
        }
    }
}

fn load_tls_acceptor(cert_path: &PathBuf, key_path: &PathBuf) -> Result<tokio_rustls::TlsAcceptor> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_file = std::fs::read(cert_path)?;
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut cert_file.as_slice()).collect();
    let certs = certs.map_err(|e| Error::Other(format!("bad certificate file: {e}")))?;

    let key_file = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_file.as_slice())
        .map_err(|e| Error::Other(format!("bad key file: {e}")))?
        .ok_or_else(|| Error::Other("no private key in key file".to_owned()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Other(format!("bad TLS configuration: {e}")))?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(config)))
}

async fn run_conn(inner: Arc<ServerInner>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = match &inner.tls {
        Some(acceptor) => {
            let tls_stream = acceptor.accept(stream).await?;
            split_stream(tls_stream)
        }
        None => split_stream(stream),
    };

    let writer = spawn_writer(write_half, inner.write_queue_size, inner.write_timeout);
    let mut reader = ConnReader::new(read_half, inner.max_frame_len);

    let ctx = ConnCtx {
        conn_id: inner.next_conn_id.fetch_add(1, Ordering::Relaxed),
        remote_ip: remote.ip(),
        writer: writer.clone(),
        frame_routes: Arc::new(Mutex::new(HashMap::new())),
    };
    let nonce = generate_nonce();
    let mut bound_sessions: HashMap<String, mpsc::Sender<SessionCmd>> = HashMap::new();

    let result = conn_loop(
        &inner,
        &ctx,
        &nonce,
        &mut reader,
        &writer,
        &mut bound_sessions,
    )
    .await;

    for tx in bound_sessions.values() {
        let _ = tx
            .send(SessionCmd::ConnClosed {
                conn_id: ctx.conn_id,
            })
            .await;
    }

    result
}

async fn conn_loop(
    inner: &Arc<ServerInner>,
    ctx: &ConnCtx,
    nonce: &str,
    reader: &mut ConnReader,
    writer: &ConnWriter,
    bound_sessions: &mut HashMap<String, mpsc::Sender<SessionCmd>>,
) -> Result<()> {
    // the effective read deadline: sessions outlive short control silences
    let read_timeout = inner.read_timeout.max(inner.session_timeout);

    loop {
        match reader.next_item(Some(read_timeout)).await? {
            Item::Request(req) => {
                let res = handle_request(inner, ctx, nonce, bound_sessions, req).await;
                // a response without CSeq means the request line itself was
                // unusable; drop the connection after answering
                let close = !res.headers.contains("CSeq");
                if let Some(hook) = &inner.handlers.response {
                    hook(&res);
                }
                writer.enqueue(res.marshal()).await?;
                if close {
                    return Err(Error::Malformed("request rejected".to_owned()));
                }
            }
            Item::Frame(frame) => {
                let route = ctx.frame_routes.lock().get(&frame.channel).cloned();
                if let Some(route) = route {
                    let _ = route.tx.try_send(SessionCmd::MediaData {
                        media_idx: route.media_idx,
                        rtcp: route.rtcp,
                        data: frame.payload,
                    });
                }
            }
            Item::Response(_) => {
                // we never send requests on server connections
                log::debug!("ignoring unsolicited response from {}", ctx.remote_ip);
            }
        }
    }
}

async fn handle_request(
    inner: &Arc<ServerInner>,
    ctx: &ConnCtx,
    nonce: &str,
    bound_sessions: &mut HashMap<String, mpsc::Sender<SessionCmd>>,
    req: Request,
) -> Response {
    if let Some(hook) = &inner.handlers.request {
        hook(&req);
    }

    let Ok(cseq) = req.cseq() else {
        return Response::new(StatusCode::BAD_REQUEST);
    };
    let base = |status: StatusCode| {
        Response::new(status).with_header("CSeq", cseq.to_string())
    };

    // OPTIONS stays open so clients can probe before authenticating
    if let Some(authenticator) = &inner.authenticator {
        if req.method != Method::Options && authenticator.verify(&req, nonce).is_err() {
            let mut res = base(StatusCode::UNAUTHORIZED);
            for challenge in authenticator.challenges(nonce) {
                res.headers.add("WWW-Authenticate", challenge);
            }
            return res;
        }
    }

    // session-addressed requests go to the session control task
    if let Some(raw) = req.headers.get("Session") {
        let Ok(header) = raw.parse::<SessionHeader>() else {
            return base(StatusCode::BAD_REQUEST);
        };
        let handle = inner.registry.sessions.read().get(&header.id).cloned();
        let Some(handle) = handle else {
            return base(StatusCode::SESSION_NOT_FOUND);
        };
        bound_sessions.insert(handle.id.clone(), handle.tx.clone());
        return forward_to_session(&handle, req, ctx, cseq).await;
    }

    match req.method {
        Method::Options => {
            base(StatusCode::OK).with_header("Public", public_methods(&inner.handlers))
        }
        Method::Describe => {
            let Some(handler) = inner.handlers.describe.clone() else {
                return base(StatusCode::NOT_IMPLEMENTED);
            };
            let (path, query) = split_path_query(&req.url);
            let answer = handler(&path, &query);
            if !answer.status.is_success() {
                return base(answer.status);
            }
            let Some(stream) = answer.stream else {
                return base(StatusCode::NOT_FOUND);
            };
            let mut content_base = req.url.clone();
            if !content_base.ends_with('/') {
                content_base.push('/');
            }
            base(StatusCode::OK)
                .with_header("Content-Base", content_base)
                .with_body("application/sdp", stream.description().marshal())
        }
        Method::Setup | Method::Announce => {
            // first SETUP or ANNOUNCE creates the session
            let id = generate_session_id();
            let handle = session::spawn(inner.clone(), id.clone());
            inner
                .registry
                .sessions
                .write()
                .insert(id.clone(), handle.clone());
            bound_sessions.insert(id.clone(), handle.tx.clone());
            let res = forward_to_session(&handle, req, ctx, cseq).await;
            if !res.status.is_success() {
                // the newborn session never got off the ground
                let _ = handle.tx.send(SessionCmd::Shutdown).await;
                bound_sessions.remove(&id);
            }
            res
        }
        Method::GetParameter | Method::SetParameter => base(StatusCode::OK),
        Method::Play | Method::Record | Method::Pause | Method::Teardown => {
            base(StatusCode::SESSION_NOT_FOUND)
        }
    }
}

async fn forward_to_session(
    handle: &SessionHandle,
    req: Request,
    ctx: &ConnCtx,
    cseq: u32,
) -> Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    let cmd = SessionCmd::Request {
        req,
        ctx: ctx.clone(),
        reply: reply_tx,
    };
    if handle.tx.send(cmd).await.is_err() {
        return Response::new(StatusCode::SESSION_NOT_FOUND)
            .with_header("CSeq", cseq.to_string());
    }
    match reply_rx.await {
        Ok(res) => res,
        Err(_) => Response::new(StatusCode::INTERNAL_SERVER_ERROR)
            .with_header("CSeq", cseq.to_string()),
    }
}

/// The `Public:` list: the always-on methods plus everything the
/// application supplied a handler for.
fn public_methods(handlers: &Handlers) -> String {
    let mut methods: Vec<&str> = vec!["OPTIONS"];
    if handlers.describe.is_some() {
        methods.push("DESCRIBE");
    }
    if handlers.announce.is_some() {
        methods.push("ANNOUNCE");
    }
    if handlers.setup.is_some() || handlers.announce.is_some() {
        methods.push("SETUP");
    }
    if handlers.play.is_some() {
        methods.push("PLAY");
    }
    if handlers.record.is_some() {
        methods.push("RECORD");
    }
    if handlers.pause.is_some() {
        methods.push("PAUSE");
    }
    methods.push("TEARDOWN");
    methods.push("GET_PARAMETER");
    methods.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_methods_follow_handlers() {
        let mut handlers = Handlers::default();
        assert_eq!(public_methods(&handlers), "OPTIONS, TEARDOWN, GET_PARAMETER");

        handlers.describe = Some(Arc::new(|_, _| DescribeAnswer {
            status: StatusCode::NOT_FOUND,
            stream: None,
        }));
        handlers.setup = Some(Arc::new(|_, _, _| SetupAnswer {
            status: StatusCode::NOT_FOUND,
            stream: None,
        }));
        handlers.play = Some(Arc::new(|_| StatusCode::OK));
        assert_eq!(
            public_methods(&handlers),
            "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER"
        );
    }
}

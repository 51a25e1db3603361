//! Per-media UDP sockets: unicast pairs (even RTP / odd RTCP), multicast
//! group membership, source demultiplexing, buffer recycling, and queued
//! writes with backpressure.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use shared::error::{Error, Result};

pub(crate) const UDP_BUFFER_SIZE: usize = 2048;

const PORT_RANGE_START: u16 = 20000;
const PORT_RANGE_END: u16 = 40000;
const BIND_ATTEMPTS: usize = 128;
const POOL_LIMIT: usize = 64;

/// Recycled receive buffers, one pool per listener pair.
pub(crate) struct BufferPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            bufs: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn get(&self) -> Vec<u8> {
        self.bufs
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; UDP_BUFFER_SIZE])
    }

    pub(crate) fn put(&self, buf: Vec<u8>) {
        let mut bufs = self.bufs.lock();
        if bufs.len() < POOL_LIMIT {
            bufs.push(buf);
        }
    }
}

/// Accepts only datagrams from the negotiated peer. With `any_port` the
/// first source port seen is learned and pinned; without it the negotiated
/// port is required from the start.
pub(crate) struct SourceFilter {
    ip: IpAddr,
    port: AtomicU16,
    any_port: bool,
}

impl SourceFilter {
    pub(crate) fn new(ip: IpAddr, port: Option<u16>, any_port: bool) -> Arc<Self> {
        Arc::new(Self {
            ip,
            port: AtomicU16::new(port.unwrap_or(0)),
            any_port,
        })
    }

    pub(crate) fn accepts(&self, src: SocketAddr) -> bool {
        if src.ip() != self.ip {
            return false;
        }
        let pinned = self.port.load(Ordering::Relaxed);
        if pinned == 0 {
            if self.any_port {
                self.port.store(src.port(), Ordering::Relaxed);
                return true;
            }
            return false;
        }
        pinned == src.port()
    }

    /// The learned or negotiated peer port, when known.
    pub(crate) fn peer_port(&self) -> Option<u16> {
        match self.port.load(Ordering::Relaxed) {
            0 => None,
            p => Some(p),
        }
    }
}

/// Queued write handle for one UDP socket.
#[derive(Clone)]
pub(crate) struct UdpWriter {
    tx: mpsc::Sender<(Bytes, SocketAddr)>,
}

impl UdpWriter {
    pub(crate) fn try_enqueue(&self, data: Bytes, dest: SocketAddr) -> Result<()> {
        self.tx.try_send((data, dest)).map_err(|e| match e {
            TrySendError::Full(_) => Error::WriteQueueFull,
            TrySendError::Closed(_) => Error::Terminated,
        })
    }
}

pub(crate) fn spawn_udp_writer(socket: Arc<UdpSocket>, capacity: usize) -> UdpWriter {
    let (tx, mut rx) = mpsc::channel::<(Bytes, SocketAddr)>(capacity);
    tokio::spawn(async move {
        while let Some((data, dest)) = rx.recv().await {
            if let Err(e) = socket.send_to(&data, dest).await {
                log::debug!("udp send to {dest} failed: {e}");
            }
        }
    });
    UdpWriter { tx }
}

/// Spawns the per-socket reader task. Each accepted datagram is handed to
/// `sink` synchronously; the buffer goes back to the pool afterwards.
pub(crate) fn spawn_udp_reader(
    socket: Arc<UdpSocket>,
    filter: Arc<SourceFilter>,
    pool: Arc<BufferPool>,
    sink: Arc<dyn Fn(Bytes) + Send + Sync>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let mut buf = pool.get();
            match socket.recv_from(&mut buf).await {
                Ok((n, src)) => {
                    if filter.accepts(src) {
                        sink(Bytes::copy_from_slice(&buf[..n]));
                    }
                    pool.put(buf);
                }
                Err(e) => {
                    log::debug!("udp recv failed: {e}");
                    break;
                }
            }
        }
    })
}

/// An RTP/RTCP socket pair on adjacent ports, RTP even.
pub(crate) struct UdpPair {
    pub(crate) rtp: Arc<UdpSocket>,
    pub(crate) rtcp: Arc<UdpSocket>,
    pub(crate) rtp_port: u16,
    pub(crate) rtcp_port: u16,
}

/// Binds an adjacent even/odd port pair, retrying with random even bases
/// until one is free.
pub(crate) async fn bind_udp_pair(ip: IpAddr) -> Result<UdpPair> {
    let mut rng = StdRng::from_os_rng();
    for _ in 0..BIND_ATTEMPTS {
        let base = rng.random_range(PORT_RANGE_START / 2..PORT_RANGE_END / 2) * 2;
        let rtp = match UdpSocket::bind(SocketAddr::new(ip, base)).await {
            Ok(s) => s,
            Err(_) => continue,
        };
        let rtcp = match UdpSocket::bind(SocketAddr::new(ip, base + 1)).await {
            Ok(s) => s,
            Err(_) => continue,
        };
        return Ok(UdpPair {
            rtp: Arc::new(rtp),
            rtcp: Arc::new(rtcp),
            rtp_port: base,
            rtcp_port: base + 1,
        });
    }
    Err(Error::PortPairExhausted)
}

/// Binds a multicast receiver/sender socket: reuse-addr so every reader on
/// the host can share the pair, group join on the wildcard interface, TTL
/// from configuration.
pub(crate) fn bind_multicast(group: Ipv4Addr, port: u16, ttl: u32) -> Result<Arc<UdpSocket>> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;

    let socket: std::net::UdpSocket = socket.into();
    Ok(Arc::new(UdpSocket::from_std(socket)?))
}

/// Tiny RTP and RTCP datagrams sent toward the server ports when entering
/// PLAY over UDP, to open symmetric-NAT mappings.
pub(crate) fn punch_datagrams() -> (Bytes, Bytes) {
    // RTP: version 2, payload type 0, zeroed remainder
    let rtp = Bytes::from_static(&[0x80, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0]);
    // RTCP: empty receiver report
    let rtcp = Bytes::from_static(&[0x80, 0xC9, 0x00, 0x01, 0, 0, 0, 0]);
    (rtp, rtcp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_filter_fixed_port() {
        let filter = SourceFilter::new("127.0.0.1".parse().unwrap(), Some(5000), false);
        assert!(filter.accepts("127.0.0.1:5000".parse().unwrap()));
        assert!(!filter.accepts("127.0.0.1:5001".parse().unwrap()));
        assert!(!filter.accepts("127.0.0.2:5000".parse().unwrap()));
    }

    #[test]
    fn test_source_filter_learns_port() {
        let filter = SourceFilter::new("127.0.0.1".parse().unwrap(), None, true);
        assert_eq!(filter.peer_port(), None);
        assert!(filter.accepts("127.0.0.1:6000".parse().unwrap()));
        assert_eq!(filter.peer_port(), Some(6000));
        // pinned: a different source port is now discarded
        assert!(!filter.accepts("127.0.0.1:6002".parse().unwrap()));
        assert!(filter.accepts("127.0.0.1:6000".parse().unwrap()));
    }

    #[test]
    fn test_source_filter_without_port_rejects() {
        let filter = SourceFilter::new("127.0.0.1".parse().unwrap(), None, false);
        assert!(!filter.accepts("127.0.0.1:6000".parse().unwrap()));
    }

    #[test]
    fn test_buffer_pool_recycles() {
        let pool = BufferPool::new();
        let a = pool.get();
        pool.put(a);
        let b = pool.get();
        assert_eq!(b.len(), UDP_BUFFER_SIZE);
        assert!(pool.bufs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_bind_pair_is_adjacent_even_odd() {
        let pair = bind_udp_pair("127.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(pair.rtp_port % 2, 0);
        assert_eq!(pair.rtcp_port, pair.rtp_port + 1);
    }

    #[tokio::test]
    async fn test_reader_filters_and_delivers() {
        let pair = bind_udp_pair("127.0.0.1".parse().unwrap()).await.unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender_port = sender.local_addr().unwrap().port();

        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        let filter = SourceFilter::new("127.0.0.1".parse().unwrap(), Some(sender_port), false);
        let _task = spawn_udp_reader(
            pair.rtp.clone(),
            filter,
            BufferPool::new(),
            Arc::new(move |data| {
                let _ = tx.try_send(data);
            }),
        );

        let dest: SocketAddr = format!("127.0.0.1:{}", pair.rtp_port).parse().unwrap();
        sender.send_to(&[1, 2, 3], dest).await.unwrap();

        let got = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), &[1, 2, 3]);
    }
}

//! Control-connection plumbing: one reader and one writer task per
//! connection, exchanging complete messages and frames. All writes funnel
//! through a bounded queue so enqueue order is wire order.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use shared::error::{Error, Result};

use crate::message::{Item, MessageDecoder};

pub(crate) type BoxedReadHalf = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

pub(crate) fn split_stream<S>(stream: S) -> (BoxedReadHalf, BoxedWriteHalf)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    (Box::new(r), Box::new(w))
}

/// Handle to the connection's writer task. Cheap to clone; every producer
/// (control task, stream fan-out, report timers) funnels through it.
#[derive(Clone)]
pub(crate) struct ConnWriter {
    tx: mpsc::Sender<Bytes>,
}

impl ConnWriter {
    /// Non-blocking enqueue for media frames; overflow is backpressure,
    /// not silent loss.
    pub(crate) fn try_enqueue(&self, data: Bytes) -> Result<()> {
        self.tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => Error::WriteQueueFull,
            TrySendError::Closed(_) => Error::Terminated,
        })
    }

    /// Blocking enqueue for control messages, which must not be dropped.
    pub(crate) async fn enqueue(&self, data: Bytes) -> Result<()> {
        self.tx.send(data).await.map_err(|_| Error::Terminated)
    }
}

/// Spawns the writer task owning the write half. The task exits when every
/// `ConnWriter` clone is dropped or a write fails.
pub(crate) fn spawn_writer(
    mut half: BoxedWriteHalf,
    capacity: usize,
    write_timeout: Duration,
) -> ConnWriter {
    let (tx, mut rx) = mpsc::channel::<Bytes>(capacity);
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            match tokio::time::timeout(write_timeout, half.write_all(&data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::debug!("connection write failed: {e}");
                    break;
                }
                Err(_) => {
                    log::debug!("connection write timed out");
                    break;
                }
            }
        }
    });
    ConnWriter { tx }
}

/// The read half plus its incremental decoder.
pub(crate) struct ConnReader {
    half: BoxedReadHalf,
    decoder: MessageDecoder,
    chunk: Vec<u8>,
}

impl ConnReader {
    pub(crate) fn new(half: BoxedReadHalf, max_frame_len: usize) -> Self {
        Self {
            half,
            decoder: MessageDecoder::new(max_frame_len),
            chunk: vec![0u8; 4096],
        }
    }

    /// Reads until one complete request, response, or frame is available.
    /// `Terminated` on EOF, `IoTimeout` when `read_timeout` elapses with no
    /// bytes arriving.
    pub(crate) async fn next_item(&mut self, read_timeout: Option<Duration>) -> Result<Item> {
        loop {
            if let Some(item) = self.decoder.next()? {
                return Ok(item);
            }
            let n = match read_timeout {
                Some(t) => tokio::time::timeout(t, self.half.read(&mut self.chunk))
                    .await
                    .map_err(|_| Error::IoTimeout("no bytes on control channel".to_owned()))??,
                None => self.half.read(&mut self.chunk).await?,
            };
            if n == 0 {
                return Err(Error::Terminated);
            }
            self.decoder.extend_from_slice(&self.chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DEFAULT_MAX_FRAME_LEN, Method, Request};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn test_writer_preserves_enqueue_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let (_, w) = split_stream(client);
        let writer = spawn_writer(w, 16, Duration::from_secs(5));
        writer.enqueue(Bytes::from_static(b"first ")).await.unwrap();
        writer.enqueue(Bytes::from_static(b"second")).await.unwrap();

        let (mut r, _w) = split_stream(server_stream);
        let mut got = vec![0u8; 12];
        r.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"first second");
    }

    #[tokio::test]
    async fn test_reader_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let (_, w) = split_stream(client);
        let writer = spawn_writer(w, 16, Duration::from_secs(5));
        let req = Request::new(Method::Options, "rtsp://h/").with_header("CSeq", "1");
        writer.enqueue(req.marshal()).await.unwrap();

        let (r, _w) = split_stream(server_stream);
        let mut reader = ConnReader::new(r, DEFAULT_MAX_FRAME_LEN);
        match reader.next_item(Some(Duration::from_secs(5))).await.unwrap() {
            Item::Request(got) => assert_eq!(got, req),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (_server_stream, _) = listener.accept().await.unwrap();

        let (_, w) = split_stream(client);
        let writer = spawn_writer(w, 1, Duration::from_secs(5));
        // fill the queue faster than the writer task can drain it
        let mut saw_full = false;
        for _ in 0..10_000 {
            if let Err(Error::WriteQueueFull) =
                writer.try_enqueue(Bytes::from(vec![0u8; 1024]))
            {
                saw_full = true;
                break;
            }
        }
        assert!(saw_full);
    }
}

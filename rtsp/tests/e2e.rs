//! End-to-end client/server scenarios over loopback sockets.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use rtsp::sdp::{SessionDescription, TransportProfile};
use rtsp::{
    Authenticator, Client, ClientOptions, Credentials, DescribeAnswer, ServerBuilder,
    ServerStream, SetupAnswer, StatusCode, TransportKind,
};

fn h264_description() -> SessionDescription {
    SessionDescription::parse(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nt=0 0\r\n\
         m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n",
    )
    .unwrap()
}

fn two_media_description() -> SessionDescription {
    SessionDescription::parse(
        "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=Stream\r\nt=0 0\r\n\
         m=video 0 RTP/AVP 96\r\na=rtpmap:96 H264/90000\r\n\
         m=audio 0 RTP/AVP 0\r\n",
    )
    .unwrap()
}

fn sample_packet(seq: u16, ts: u32, ssrc: u32, payload: &'static [u8]) -> rtsp::rtp::Packet {
    rtsp::rtp::Packet {
        header: rtsp::rtp::Header {
            payload_type: 96,
            sequence_number: seq,
            timestamp: ts,
            ssrc,
            ..Default::default()
        },
        payload: Bytes::from_static(payload),
    }
}

/// Serves `stream` on an ephemeral port and returns its URL.
async fn serve(builder: ServerBuilder) -> String {
    let server = builder.bind().await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    format!("rtsp://127.0.0.1:{}/stream", addr.port())
}

fn play_server(stream: Arc<ServerStream>) -> ServerBuilder {
    let describe_stream = stream.clone();
    let setup_stream = stream;
    ServerBuilder::new("127.0.0.1:0")
        .on_describe(move |_, _| DescribeAnswer {
            status: StatusCode::OK,
            stream: Some(describe_stream.clone()),
        })
        .on_setup(move |_, _, _| SetupAnswer {
            status: StatusCode::OK,
            stream: Some(setup_stream.clone()),
        })
        .on_play(|_| StatusCode::OK)
        .on_pause(|_| StatusCode::OK)
}

/// Writes RTP packets on media 0 every 20 ms until aborted.
fn spawn_publisher(
    stream: Arc<ServerStream>,
    ssrc: u32,
    payload: &'static [u8],
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut seq = 0u16;
        loop {
            let _ = stream.write_packet(0, &sample_packet(seq, 3000 * seq as u32, ssrc, payload));
            seq = seq.wrapping_add(1);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
}

// Scenario: plain UDP play. DESCRIBE/SETUP/PLAY over UDP unicast, one RTP
// packet published, delivered exactly once to the packet callback.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn play_over_udp_delivers_rtp() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let url = serve(play_server(stream.clone())).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.initial_udp_read_timeout = Duration::from_secs(10);
    options.on_packet_rtp = Some(Arc::new(move |media_idx, pt, packet| {
        let _ = tx.send((media_idx, pt, packet));
    }));

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();
    client.setup_all().await.unwrap();
    assert_eq!(stream.reader_count(), 0);

    let publisher = spawn_publisher(stream.clone(), 0x38F27A2F, &[0x05, 0x02, 0x03, 0x04]);
    client.play(None).await.unwrap();
    assert_eq!(stream.reader_count(), 1);

    let (media_idx, pt, packet) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(media_idx, 0);
    assert_eq!(pt, 96);
    assert_eq!(packet.header.ssrc, 0x38F27A2F);
    assert_eq!(packet.payload.as_ref(), &[0x05, 0x02, 0x03, 0x04]);

    publisher.abort();
    client.teardown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stream.reader_count(), 0);
}

// Scenario: the server answers 461 to the UDP SETUP; the client switches
// to TCP-interleaved, announces the cause once, and media flows.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downgrade_to_tcp_on_461() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let url = serve(play_server(stream.clone()).udp(false)).await;

    let (pkt_tx, mut pkt_rx) = mpsc::unbounded_channel();
    let (switch_tx, mut switch_rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.on_packet_rtp = Some(Arc::new(move |_, _, packet| {
        let _ = pkt_tx.send(packet);
    }));
    options.on_transport_switch = Some(Arc::new(move |cause: &str| {
        let _ = switch_tx.send(cause.to_owned());
    }));

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();
    client.setup_all().await.unwrap();

    let cause = switch_rx.try_recv().unwrap();
    assert_eq!(cause, "switching to TCP because server requested it");
    assert!(switch_rx.try_recv().is_err(), "switch fired more than once");

    let publisher = spawn_publisher(stream.clone(), 0x1111, &[9, 9]);
    client.play(None).await.unwrap();

    let packet = tokio::time::timeout(Duration::from_secs(5), pkt_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.payload.as_ref(), &[9, 9]);

    publisher.abort();
    client.teardown().await.unwrap();
}

// Scenario: SETUP and PLAY succeed over UDP but no RTP ever arrives; the
// client tears down, re-dials, redoes the handshake over TCP, and then
// delivers media.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn downgrade_to_tcp_on_udp_silence() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let url = serve(play_server(stream.clone())).await;

    let (pkt_tx, mut pkt_rx) = mpsc::unbounded_channel();
    let (switch_tx, mut switch_rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.initial_udp_read_timeout = Duration::from_secs(1);
    options.on_packet_rtp = Some(Arc::new(move |_, _, packet| {
        let _ = pkt_tx.send(packet);
    }));
    let publisher_stream = stream.clone();
    let publisher_slot: Arc<parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>> =
        Arc::new(parking_lot::Mutex::new(None));
    let slot = publisher_slot.clone();
    options.on_transport_switch = Some(Arc::new(move |cause: &str| {
        let _ = switch_tx.send(cause.to_owned());
        // only start feeding media once the downgrade begins
        let mut slot = slot.lock();
        if slot.is_none() {
            *slot = Some(spawn_publisher(publisher_stream.clone(), 0x2222, &[7]));
        }
    }));

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();
    client.setup_all().await.unwrap();
    client.play(None).await.unwrap();

    let cause = tokio::time::timeout(Duration::from_secs(5), switch_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cause, "no UDP packets received, switching to TCP");

    let packet = tokio::time::timeout(Duration::from_secs(5), pkt_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.payload.as_ref(), &[7]);

    if let Some(task) = publisher_slot.lock().take() {
        task.abort();
    }
    client.teardown().await.unwrap();
}

// Scenario: digest authentication. The first DESCRIBE is answered 401;
// the client retransmits it once with an Authorization header and then
// parses the SDP.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn digest_auth_retry() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let describe_count = Arc::new(AtomicUsize::new(0));
    let authorized_describe = Arc::new(AtomicUsize::new(0));

    let dc = describe_count.clone();
    let ad = authorized_describe.clone();
    let builder = play_server(stream.clone())
        .authenticator(Authenticator::new("IPCAM", |user| {
            (user == "admin").then(|| "secret".to_owned())
        }))
        .on_request(move |req| {
            if req.method == rtsp::Method::Describe {
                dc.fetch_add(1, Ordering::SeqCst);
                if let Some(value) = req.headers.get("Authorization") {
                    if value.starts_with("Digest") {
                        ad.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
    let url = serve(builder).await;

    let mut options = ClientOptions::default();
    options.credentials = Some(Credentials {
        username: "admin".to_owned(),
        password: "secret".to_owned(),
    });

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    let description = client.describe().await.unwrap();
    assert_eq!(description.medias.len(), 1);

    assert_eq!(describe_count.load(Ordering::SeqCst), 2);
    assert_eq!(authorized_describe.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_password_fails_hard() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let builder = play_server(stream).authenticator(Authenticator::new("IPCAM", |user| {
        (user == "admin").then(|| "secret".to_owned())
    }));
    let url = serve(builder).await;

    let mut options = ClientOptions::default();
    options.credentials = Some(Credentials {
        username: "admin".to_owned(),
        password: "wrong".to_owned(),
    });
    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    assert!(matches!(client.describe().await, Err(rtsp::Error::Unauthorized)));
}

// Scenario: receiver report accuracy. After one RTP packet and a sender
// report with a pinned NTP/RTP pair, the client's receiver report carries
// the highest sequence number, the middle 32 NTP bits of the SR, and a
// plausible delay.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn receiver_report_answers_sender_report() {
    use std::time::{Duration as StdDuration, UNIX_EPOCH};

    let wallclock = UNIX_EPOCH + StdDuration::from_secs(1_502_551_800); // 2017-08-12T15:30:00Z
    let expected_lsr = shared_ntp_middle(wallclock);

    let stream =
        ServerStream::with_report_period(h264_description(), Duration::from_millis(700)).unwrap();
    let (rtcp_tx, mut rtcp_rx) = mpsc::unbounded_channel();
    let builder = play_server(stream.clone()).report_period(Duration::from_millis(700))
        .on_packet_rtcp(move |_, media_idx, packet| {
            let _ = rtcp_tx.send((media_idx, packet));
        });
    let url = serve(builder).await;

    let mut options = ClientOptions::default();
    options.preferred_transport = TransportKind::TcpInterleaved;
    options.report_period = Duration::from_millis(500);

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();
    client.setup_all().await.unwrap();
    client.play(None).await.unwrap();

    stream
        .write_packet(0, &sample_packet(946, 54352, 753621, &[1, 2, 3, 4]))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    stream.set_ntp_rtp(0, wallclock, 54352);

    // wait for a receiver report that has seen the sender report
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        let (media_idx, packet) = tokio::time::timeout(remaining, rtcp_rx.recv())
            .await
            .expect("no receiver report before deadline")
            .unwrap();
        assert_eq!(media_idx, 0);
        let rtsp::rtcp::RtcpPacket::ReceiverReport(rr) = packet else {
            continue;
        };
        assert_eq!(rr.reports.len(), 1);
        let block = &rr.reports[0];
        assert_eq!(block.ssrc, 753621);
        assert_eq!(block.last_sequence_number, 946);
        if block.last_sender_report == 0 {
            // emitted before the SR arrived
            continue;
        }
        assert_eq!(block.last_sender_report, expected_lsr);
        // delay is in 1/65536 s units and must stay under the test runtime
        assert!(block.delay > 0, "delay not populated");
        assert!(block.delay < 5 * 65536, "delay {} implausible", block.delay);
        break;
    }

    client.teardown().await.unwrap();
}

fn shared_ntp_middle(t: std::time::SystemTime) -> u32 {
    let ntp = {
        let d = t.duration_since(std::time::UNIX_EPOCH).unwrap();
        let u = d.as_nanos() as u64;
        let mut s = u / 1_000_000_000;
        s += 0x83AA_7E80;
        let mut f = u % 1_000_000_000;
        f <<= 32;
        f /= 1_000_000_000;
        (s << 32) | f
    };
    (ntp >> 16) as u32
}

// Scenario: partial-media setup. Only the second media of a two-media
// stream is set up; publishes on both medias deliver exactly the packets
// of the set-up one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_setup_receives_only_that_media() {
    let stream = ServerStream::new(two_media_description()).unwrap();
    let url = serve(play_server(stream.clone())).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.preferred_transport = TransportKind::TcpInterleaved;
    options.on_packet_rtp = Some(Arc::new(move |media_idx, pt, packet| {
        let _ = tx.send((media_idx, pt, packet));
    }));

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();
    client.setup(1).await.unwrap();
    client.play(None).await.unwrap();

    for i in 0..5u16 {
        stream
            .write_packet(0, &sample_packet(i, 0, 0xAAAA, &[0xAA]))
            .unwrap();
        stream
            .write_packet(1, &sample_packet(i, 0, 0xBBBB, &[0xBB]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (media_idx, _pt, packet) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(media_idx, 1);
    assert_eq!(packet.header.ssrc, 0xBBBB);

    // drain: everything delivered must belong to media 1
    while let Ok((media_idx, _, packet)) = rx.try_recv() {
        assert_eq!(media_idx, 1);
        assert_eq!(packet.header.ssrc, 0xBBBB);
    }

    client.teardown().await.unwrap();
}

// Keepalive prevents the server-side idle reaper from destroying the
// session while media keeps flowing.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn keepalive_outlives_session_timeout() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let url = serve(
        play_server(stream.clone()).session_timeout(Duration::from_secs(2)),
    )
    .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.preferred_transport = TransportKind::TcpInterleaved;
    options.keepalive_interval = Some(Duration::from_millis(500));
    options.on_packet_rtp = Some(Arc::new(move |_, _, packet| {
        let _ = tx.send(packet);
    }));

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();
    client.setup_all().await.unwrap();
    client.play(None).await.unwrap();

    // outlive the 2 s session timeout, then verify media still flows
    tokio::time::sleep(Duration::from_secs(3)).await;
    let publisher = spawn_publisher(stream.clone(), 0x3333, &[1]);
    let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("session was reaped despite keepalive")
        .unwrap();
    assert_eq!(packet.payload.as_ref(), &[1]);

    publisher.abort();
    client.teardown().await.unwrap();
}

// Record direction: ANNOUNCE + SETUP(record) + RECORD, then client-written
// packets surface in the server's packet callback, and a mid-stream SSRC
// change is reported as a decode error instead of being delivered.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn record_delivers_packets_to_server() {
    let (rtp_tx, mut rtp_rx) = mpsc::unbounded_channel();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let builder = ServerBuilder::new("127.0.0.1:0")
        .on_announce(|_, _, _| StatusCode::OK)
        .on_record(|_| StatusCode::OK)
        .on_packet_rtp(move |_, media_idx, pt, packet| {
            let _ = rtp_tx.send((media_idx, pt, packet));
        })
        .on_decode_error(move |_, e| {
            let _ = err_tx.send(e.to_string());
        });
    let url = serve(builder).await;

    let mut options = ClientOptions::default();
    options.preferred_transport = TransportKind::TcpInterleaved;

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    client.announce(h264_description()).await.unwrap();
    client.setup_all().await.unwrap();
    client.record().await.unwrap();

    client
        .write_packet(0, &sample_packet(10, 100, 0x5555, &[4, 5, 6]))
        .unwrap();
    let (media_idx, pt, packet) = tokio::time::timeout(Duration::from_secs(5), rtp_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(media_idx, 0);
    assert_eq!(pt, 96);
    assert_eq!(packet.header.sequence_number, 10);
    assert_eq!(packet.payload.as_ref(), &[4, 5, 6]);

    // a different SSRC on the same format is dropped and reported
    client
        .write_packet(0, &sample_packet(11, 200, 0x6666, &[7]))
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(err.contains("wrong SSRC"), "unexpected error {err}");

    client.teardown().await.unwrap();
}

// SRTP: an SAVP stream advertises MIKEY in its description, media is
// encrypted on the wire, and the client decrypts it transparently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn savp_stream_round_trip() {
    let mut description = h264_description();
    description.medias[0].profile = TransportProfile::Savp;
    let stream = ServerStream::new(description).unwrap();
    let url = serve(play_server(stream.clone())).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut options = ClientOptions::default();
    options.preferred_transport = TransportKind::TcpInterleaved;
    options.on_packet_rtp = Some(Arc::new(move |_, _, packet| {
        let _ = tx.send(packet);
    }));

    let mut client = Client::dial(&url, options).await.unwrap();
    client.options().await.unwrap();
    let described = client.describe().await.unwrap();
    assert!(described.medias[0].key_mgmt.is_some(), "no MIKEY in DESCRIBE");
    client.setup_all().await.unwrap();
    client.play(None).await.unwrap();

    let publisher = spawn_publisher(stream.clone(), 0x7777, &[0x10, 0x20, 0x30]);
    let packet = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(packet.header.ssrc, 0x7777);
    assert_eq!(packet.payload.as_ref(), &[0x10, 0x20, 0x30]);

    publisher.abort();
    client.teardown().await.unwrap();
}

// Protocol-state errors: PLAY before SETUP is answered 454 (no session),
// and a second SETUP of the same media is rejected.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_machine_rejections() {
    let stream = ServerStream::new(h264_description()).unwrap();
    let url = serve(play_server(stream.clone())).await;

    let mut client = Client::dial(&url, ClientOptions::default()).await.unwrap();
    client.options().await.unwrap();
    client.describe().await.unwrap();

    // PLAY with no session
    let err = client.play(None).await.unwrap_err();
    assert!(matches!(err, rtsp::Error::BadStatus(454, _)), "got {err:?}");

    client.setup(0).await.unwrap();
    // double SETUP of the same media is refused locally
    assert!(client.setup(0).await.is_err());
}

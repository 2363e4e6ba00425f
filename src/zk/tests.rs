//! Mock-device integration tests for the session client.
//!
//! Each test stands up a scripted device on loopback (UDP datagrams or a
//! framed TCP stream built with the real codec) and drives the public
//! client API against it.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::client::{LiveEvent, ZkClient, ZkOptions};
use super::codec::{Frame, build_frame, encode_time, parse_frame, wrap_tcp};
use super::consts::*;
use super::error::ZkError;
use chrono::NaiveDate;

const SESSION: u16 = 0x1234;

fn options(addr: SocketAddr, udp: bool) -> ZkOptions {
    ZkOptions {
        ip: addr.ip().to_string(),
        port: addr.port(),
        force_udp: udp,
        timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

async fn next_seen(rx: &mut UnboundedReceiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for mock traffic")
        .expect("mock channel closed")
}

/// Run a scripted UDP device. Every datagram from the client is parsed,
/// recorded, and answered with whatever the handler returns.
async fn spawn_udp_mock<F>(mut handler: F) -> (SocketAddr, UnboundedReceiver<Frame>)
where
    F: FnMut(&Frame) -> Vec<Vec<u8>> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock socket");
    let addr = socket.local_addr().expect("mock local addr");
    let (seen_tx, seen_rx) = unbounded_channel();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let frame = parse_frame(&buf[..n]).expect("client sent malformed frame");
            let replies = handler(&frame);
            if seen_tx.send(frame).is_err() {
                break;
            }
            for reply in replies {
                let _ = socket.send_to(&reply, peer).await;
            }
        }
    });

    (addr, seen_rx)
}

struct TcpMock {
    addr: SocketAddr,
    seen: UnboundedReceiver<Frame>,
    /// Unsolicited raw bytes (e.g. framed REG_EVENT pushes) written to the
    /// client verbatim, so tests control write boundaries.
    push: UnboundedSender<Vec<u8>>,
}

async fn read_client_frame<R>(stream: &mut R) -> std::io::Result<Frame>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut top = [0u8; 8];
    stream.read_exact(&mut top).await?;
    let len = u32::from_le_bytes([top[4], top[5], top[6], top[7]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(parse_frame(&body).expect("client sent malformed frame"))
}

/// Run a scripted TCP device on one accepted connection.
async fn spawn_tcp_mock<F>(mut handler: F) -> TcpMock
where
    F: FnMut(&Frame) -> Vec<Vec<u8>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock listener");
    let addr = listener.local_addr().expect("mock local addr");
    let (seen_tx, seen_rx) = unbounded_channel();
    let (push_tx, mut push_rx) = unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (mut reader, mut writer) = stream.into_split();
        loop {
            tokio::select! {
                request = read_client_frame(&mut reader) => {
                    let Ok(frame) = request else { break };
                    let replies = handler(&frame);
                    if seen_tx.send(frame).is_err() {
                        break;
                    }
                    for reply in replies {
                        if writer.write_all(&wrap_tcp(&reply)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(bytes) = push_rx.recv() => {
                    if writer.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    TcpMock {
        addr,
        seen: seen_rx,
        push: push_tx,
    }
}

fn ack_ok(request: &Frame) -> Vec<u8> {
    build_frame(CMD_ACK_OK, SESSION, request.reply_id, &[])
}

#[tokio::test]
async fn udp_handshake_without_password() {
    let (addr, mut seen) = spawn_udp_mock(|request| vec![ack_ok(request)]).await;

    let mut client = ZkClient::new(options(addr, true));
    client.connect().await.expect("handshake");
    assert!(client.is_connected());
    assert_eq!(client.session_id(), SESSION);

    // exactly one frame on the wire: the CONNECT, with a zero session id
    let connect = next_seen(&mut seen).await;
    assert_eq!(connect.command, CMD_CONNECT);
    assert_eq!(connect.session_id, 0);
    assert_eq!(connect.reply_id, 0);
    assert!(seen.try_recv().is_err());
}

#[tokio::test]
async fn udp_handshake_with_password() {
    let (addr, mut seen) = spawn_udp_mock(|request| match request.command {
        CMD_CONNECT => vec![build_frame(CMD_ACK_UNAUTH, SESSION, request.reply_id, &[])],
        CMD_AUTH => {
            // comm key for password 12345 and session 0x1234 at 50 ticks
            if request.payload == [0x6D, 0xE1, 0x32, 0x6B] {
                vec![ack_ok(request)]
            } else {
                vec![build_frame(CMD_ACK_UNAUTH, SESSION, request.reply_id, &[])]
            }
        }
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut opts = options(addr, true);
    opts.password = 12345;
    let mut client = ZkClient::new(opts);
    client.connect().await.expect("authenticated handshake");
    assert!(client.is_connected());
    assert_eq!(client.session_id(), SESSION);

    let connect = next_seen(&mut seen).await;
    assert_eq!(connect.command, CMD_CONNECT);
    let auth = next_seen(&mut seen).await;
    assert_eq!(auth.command, CMD_AUTH);
    assert_eq!(auth.session_id, SESSION);
}

#[tokio::test]
async fn udp_handshake_wrong_password() {
    let (addr, _seen) = spawn_udp_mock(|request| match request.command {
        CMD_CONNECT => vec![build_frame(CMD_ACK_UNAUTH, SESSION, request.reply_id, &[])],
        _ => vec![build_frame(CMD_ACK_UNAUTH, SESSION, request.reply_id, &[])],
    })
    .await;

    let mut opts = options(addr, true);
    opts.password = 54321;
    let mut client = ZkClient::new(opts);
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ZkError::Unauthenticated));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn reply_ids_increase_across_requests() {
    let time = NaiveDate::from_ymd_opt(2025, 5, 6)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap();
    let (addr, mut seen) = spawn_udp_mock(move |request| match request.command {
        CMD_GET_TIME => vec![build_frame(
            CMD_ACK_OK,
            SESSION,
            request.reply_id,
            &encode_time(&time).to_le_bytes(),
        )],
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut client = ZkClient::new(options(addr, true));
    client.connect().await.unwrap();
    assert_eq!(client.get_time().await.unwrap(), time);
    client.disable_device().await.unwrap();
    client.enable_device().await.unwrap();
    client.refresh_data().await.unwrap();

    let mut reply_ids = Vec::new();
    for _ in 0..5 {
        reply_ids.push(next_seen(&mut seen).await.reply_id);
    }
    assert_eq!(reply_ids, vec![0, 1, 2, 3, 4]);
}

/// 100 eight-byte records streamed over the legacy PREPARE_DATA path after
/// the device rejects the chunked read.
#[tokio::test]
async fn udp_bulk_attendance_legacy_stream() {
    let base = NaiveDate::from_ymd_opt(2025, 4, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();

    // table body: 4-byte record-area size + 100 records of 8 bytes
    let mut body = Vec::with_capacity(804);
    body.extend_from_slice(&800u32.to_le_bytes());
    for i in 0..100u16 {
        let t = base + chrono::Duration::seconds(i as i64);
        body.extend_from_slice(&(i + 1).to_le_bytes());
        body.push(1);
        body.extend_from_slice(&encode_time(&t).to_le_bytes());
        body.push(0);
    }
    assert_eq!(body.len(), 804);

    let (addr, _seen) = spawn_udp_mock(move |request| match request.command {
        CMD_GET_FREE_SIZES => {
            let mut sizes = vec![0u8; 80];
            sizes[32..36].copy_from_slice(&100u32.to_le_bytes()); // record count
            vec![build_frame(CMD_ACK_OK, SESSION, request.reply_id, &sizes)]
        }
        // firmware without read-with-buffer support
        CMD_PREPARE_BUFFER => vec![build_frame(CMD_ACK_ERROR, SESSION, request.reply_id, &[])],
        CMD_ATTLOG_RRQ => {
            let mut replies = vec![build_frame(
                CMD_PREPARE_DATA,
                SESSION,
                request.reply_id,
                &(body.len() as u32).to_le_bytes(),
            )];
            // stream in datagram-sized pieces, then terminate
            for piece in body.chunks(512) {
                replies.push(build_frame(CMD_DATA, SESSION, request.reply_id, piece));
            }
            replies.push(build_frame(CMD_ACK_OK, SESSION, request.reply_id, &[]));
            replies
        }
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut client = ZkClient::new(options(addr, true));
    client.connect().await.unwrap();
    let records = client.get_attendance().await.expect("bulk download");

    assert_eq!(records.len(), 100);
    assert_eq!(records[0].user_id, "1");
    assert_eq!(records[0].timestamp, base);
    assert_eq!(records[99].user_id, "100");
    assert_eq!(
        records[99].timestamp,
        base + chrono::Duration::seconds(99)
    );
}

/// Chunked 1503/1504 download over TCP, split across several chunks plus a
/// remainder, with the device buffer freed afterwards.
#[tokio::test]
async fn tcp_buffered_read_in_chunks() {
    let body: Vec<u8> = (0..140_000u32).map(|i| (i % 251) as u8).collect();
    let expected = body.clone();

    let mock = spawn_tcp_mock(move |request| match request.command {
        CMD_PREPARE_BUFFER => {
            let mut payload = vec![0u8; 5];
            payload[1..5].copy_from_slice(&(body.len() as u32).to_le_bytes());
            vec![build_frame(CMD_PREPARE_DATA, SESSION, request.reply_id, &payload)]
        }
        CMD_READ_BUFFER => {
            let start = u32::from_le_bytes(request.payload[0..4].try_into().unwrap()) as usize;
            let size = u32::from_le_bytes(request.payload[4..8].try_into().unwrap()) as usize;
            vec![build_frame(
                CMD_DATA,
                SESSION,
                request.reply_id,
                &body[start..start + size],
            )]
        }
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut client = ZkClient::new(options(mock.addr, false));
    client.connect().await.unwrap();
    let data = client
        .read_with_buffer(CMD_ATTLOG_RRQ, 0, 0)
        .await
        .expect("chunked download");
    assert_eq!(data, expected);

    let mut seen = mock.seen;
    let mut commands = Vec::new();
    for _ in 0..6 {
        commands.push(next_seen(&mut seen).await.command);
    }
    // 140000 bytes = two full 65472-byte chunks + a 9056-byte remainder
    assert_eq!(
        commands,
        vec![
            CMD_CONNECT,
            CMD_PREPARE_BUFFER,
            CMD_READ_BUFFER,
            CMD_READ_BUFFER,
            CMD_READ_BUFFER,
            CMD_FREE_DATA,
        ]
    );
}

#[tokio::test]
async fn tcp_live_capture_yields_event_and_acks() {
    let mut mock = spawn_tcp_mock(|request| match request.command {
        // event acks are fire-and-forget
        CMD_ACK_OK => vec![],
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut client = ZkClient::new(options(mock.addr, false));
    client.connect().await.unwrap();
    client.live_capture_begin().await.expect("capture setup");

    // setup traffic: CONNECT, CANCELCAPTURE, STARTVERIFY, REG_EVENT
    for expected in [CMD_CONNECT, CMD_CANCELCAPTURE, CMD_STARTVERIFY, CMD_REG_EVENT] {
        assert_eq!(next_seen(&mut mock.seen).await.command, expected);
    }

    // push one 12-byte punch: user 7, status 1, punch 0, 2025-01-15 09:30:00
    let mut payload = vec![0u8; 12];
    payload[0..4].copy_from_slice(&7u32.to_le_bytes());
    payload[4] = 1;
    payload[6..12].copy_from_slice(&[25, 1, 15, 9, 30, 0]);
    mock.push
        .send(wrap_tcp(&build_frame(CMD_REG_EVENT, SESSION, 0, &payload)))
        .expect("push event");

    let event = client
        .live_capture_next(Duration::from_secs(5))
        .await
        .expect("live event");
    let LiveEvent::Punch(punch) = event else {
        panic!("expected a punch, got a tick");
    };
    assert_eq!(punch.user_id, "7");
    assert_eq!(punch.status, 1);
    assert_eq!(punch.punch, 0);
    assert_eq!(
        punch.timestamp,
        NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap()
    );

    // the device must see an immediate ACK for the pushed frame
    let ack = next_seen(&mut mock.seen).await;
    assert_eq!(ack.command, CMD_ACK_OK);
    assert_eq!(ack.reply_id, 0);
}

/// A REG_EVENT frame whose length prefix and body arrive as separate
/// writes, with the gap outlasting the soft timeout. The soft timeout may
/// only fire between frames; a frame in flight must be read to completion,
/// not torn in half and lost.
#[tokio::test]
async fn tcp_live_capture_split_frame_survives_soft_timeout() {
    let mut mock = spawn_tcp_mock(|request| match request.command {
        CMD_ACK_OK => vec![],
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut client = ZkClient::new(options(mock.addr, false));
    client.connect().await.unwrap();
    client.live_capture_begin().await.unwrap();
    for expected in [CMD_CONNECT, CMD_CANCELCAPTURE, CMD_STARTVERIFY, CMD_REG_EVENT] {
        assert_eq!(next_seen(&mut mock.seen).await.command, expected);
    }

    let mut payload = vec![0u8; 12];
    payload[0..4].copy_from_slice(&9u32.to_le_bytes());
    payload[4] = 1;
    payload[6..12].copy_from_slice(&[25, 3, 9, 7, 45, 10]);
    let packet = wrap_tcp(&build_frame(CMD_REG_EVENT, SESSION, 0, &payload));

    // length prefix plus two body bytes now, the remainder 300ms later
    mock.push.send(packet[..10].to_vec()).expect("push head");
    let push = mock.push.clone();
    let tail = packet[10..].to_vec();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = push.send(tail);
    });

    let mut punch = None;
    for _ in 0..10 {
        match client
            .live_capture_next(Duration::from_millis(100))
            .await
            .expect("stream must survive the gap")
        {
            LiveEvent::Punch(p) => {
                punch = Some(p);
                break;
            }
            LiveEvent::Tick => {}
        }
    }
    let punch = punch.expect("split event frame was lost");
    assert_eq!(punch.user_id, "9");
    assert_eq!(
        punch.timestamp,
        NaiveDate::from_ymd_opt(2025, 3, 9)
            .unwrap()
            .and_hms_opt(7, 45, 10)
            .unwrap()
    );
    assert!(client.is_connected());

    // and the stream keeps ticking cleanly afterwards
    let event = client
        .live_capture_next(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(matches!(event, LiveEvent::Tick));
}

#[tokio::test]
async fn tcp_live_capture_soft_timeout_and_cancel() {
    let mut mock = spawn_tcp_mock(|request| match request.command {
        CMD_ACK_OK => vec![],
        _ => vec![ack_ok(request)],
    })
    .await;

    let mut client = ZkClient::new(options(mock.addr, false));
    client.connect().await.unwrap();
    client.live_capture_begin().await.unwrap();
    let guard = client.capture_guard();

    // no traffic: the soft timeout yields a tick and keeps the session up
    let event = client
        .live_capture_next(Duration::from_millis(100))
        .await
        .unwrap();
    assert!(matches!(event, LiveEvent::Tick));
    assert!(client.is_connected());

    // cancellation is observed at the next checkpoint without any recv
    guard.cancel();
    let event = client
        .live_capture_next(Duration::from_secs(30))
        .await
        .unwrap();
    assert!(matches!(event, LiveEvent::Tick));

    client.live_capture_end().await.unwrap();
    assert!(client.is_connected());

    // teardown deregisters events (REG_EVENT with zero flags)
    let mut dereg = None;
    for _ in 0..8 {
        let frame = next_seen(&mut mock.seen).await;
        if frame.command == CMD_REG_EVENT && frame.payload == 0u32.to_le_bytes() {
            dereg = Some(frame);
            break;
        }
    }
    assert!(dereg.is_some(), "no event deregistration observed");
}

#[tokio::test]
async fn network_fault_marks_session_disconnected() {
    let mock = spawn_tcp_mock(|request| match request.command {
        CMD_CONNECT => vec![ack_ok(request)],
        // anything else: never answer
        _ => Vec::new(),
    })
    .await;

    let mut opts = options(mock.addr, false);
    opts.timeout = Duration::from_millis(200);
    let mut client = ZkClient::new(opts);
    client.connect().await.unwrap();

    let err = client.get_time().await.unwrap_err();
    assert!(matches!(err, ZkError::Timeout));
    assert!(!client.is_connected());

    // and the fault is sticky until the next connect()
    let err = client.refresh_data().await.unwrap_err();
    assert!(matches!(err, ZkError::NotConnected));
}

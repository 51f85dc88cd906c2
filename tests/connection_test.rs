use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::info;
use nsq_conn_rs::commands::{publish_message, subscribe};
use nsq_conn_rs::compression::{StreamDecoder, StreamEncoder};
use nsq_conn_rs::protocol::{MessageFrame, CLOSE_WAIT};
use nsq_conn_rs::{
    Command, Connection, ConnectionConfig, ConnectionState, Error, Frame, MessageId,
    MessageState, ReaderKind, TlsConfig,
};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

fn init_logger() {
    let _ = env_logger::Builder::new()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp_millis()
        .is_test(true)
        .try_init();
}

fn response(data: impl Into<Bytes>) -> Frame {
    Frame::Response(data.into())
}

fn error_frame(data: impl Into<String>) -> Frame {
    Frame::Error(Bytes::from(data.into()))
}

fn message_frame(id: &[u8; 16], body: &'static [u8]) -> Frame {
    Frame::Message(MessageFrame {
        timestamp: 1_700_000_000_000_000_000,
        attempts: 1,
        id: MessageId::new(*id),
        body: Bytes::from_static(body),
    })
}

/// 一个只懂脚本的 nsqd，每个测试自己驱动它
struct MockNsqd {
    tcp: Option<TcpStream>,
    tls: Option<TlsStream<TcpStream>>,
    decoder: StreamDecoder,
    encoder: StreamEncoder,
    buf: BytesMut,
}

impl MockNsqd {
    async fn accept(listener: &TcpListener) -> Self {
        let (mut tcp, _) = listener.accept().await.unwrap();
        let mut magic = [0u8; 4];
        tcp.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, b"  V2");

        Self {
            tcp: Some(tcp),
            tls: None,
            decoder: StreamDecoder::Passthrough,
            encoder: StreamEncoder::Passthrough,
            buf: BytesMut::new(),
        }
    }

    /// 读取IDENTIFY并按 `response` 完成TLS和压缩切换，返回客户端发送的IDENTIFY内容
    async fn handshake(
        &mut self,
        response_body: serde_json::Value,
        acceptor: Option<TlsAcceptor>,
    ) -> serde_json::Value {
        let (line, body) = self.read_command().await.unwrap();
        assert_eq!(line, "IDENTIFY");
        let identify: serde_json::Value = serde_json::from_slice(&body).unwrap();
        self.send(response(response_body.to_string())).await;

        if response_body["tls_v1"] == true {
            let tcp = self.tcp.take().unwrap();
            let tls = acceptor.unwrap().accept(tcp).await.unwrap();
            self.tls = Some(tls);
            self.send(response("OK")).await;
        }

        if response_body["snappy"] == true {
            assert!(self.buf.is_empty());
            self.decoder = StreamDecoder::snappy();
            self.encoder = StreamEncoder::snappy();
            self.send(response("OK")).await;
        } else if response_body["deflate"] == true {
            assert!(self.buf.is_empty());
            let level = response_body["deflate_level"].as_u64().unwrap_or(6) as u32;
            self.decoder = StreamDecoder::deflate();
            self.encoder = StreamEncoder::deflate(level);
            self.send(response("OK")).await;
        }

        identify
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        let n = match self.tls.as_mut() {
            Some(tls) => tls.read(&mut chunk).await,
            None => self.tcp.as_mut().unwrap().read(&mut chunk).await,
        }
        .unwrap_or(0);
        if n == 0 {
            return false;
        }
        self.decoder.decode(&chunk[..n], &mut self.buf).unwrap();
        true
    }

    /// 读取一条命令，返回 (命令行, 消息体)；连接结束时返回 None
    async fn read_command(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line = String::from_utf8_lossy(&self.buf[..pos]).to_string();
                let name = line.split(' ').next().unwrap_or_default();
                if !matches!(name, "IDENTIFY" | "PUB" | "DPUB" | "MPUB" | "AUTH") {
                    self.buf.advance(pos + 1);
                    return Some((line, Vec::new()));
                }
                if self.buf.len() >= pos + 5 {
                    let size_bytes = [
                        self.buf[pos + 1],
                        self.buf[pos + 2],
                        self.buf[pos + 3],
                        self.buf[pos + 4],
                    ];
                    let size = u32::from_be_bytes(size_bytes) as usize;
                    if self.buf.len() >= pos + 5 + size {
                        self.buf.advance(pos + 5);
                        let body = self.buf.split_to(size).to_vec();
                        return Some((line, body));
                    }
                }
            }
            if !self.fill().await {
                return None;
            }
        }
    }

    async fn expect(&mut self, expected: &str) -> Vec<u8> {
        let (line, body) = self.read_command().await.unwrap();
        assert_eq!(line, expected);
        body
    }

    async fn send(&mut self, frame: Frame) {
        self.try_send(frame).await.unwrap();
    }

    async fn try_send(&mut self, frame: Frame) -> std::io::Result<()> {
        let wire = self.encoder.encode(&frame.encode()).unwrap();
        match self.tls.as_mut() {
            Some(tls) => {
                tls.write_all(&wire).await?;
                tls.flush().await
            }
            None => {
                let tcp = self.tcp.as_mut().unwrap();
                tcp.write_all(&wire).await?;
                tcp.flush().await
            }
        }
    }

    /// 等待客户端关闭连接
    async fn drain(&mut self) {
        while self.read_command().await.is_some() {}
    }
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("等待条件超时");
}

#[tokio::test]
async fn test_snappy_publish_and_consume() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        let identify = nsqd
            .handshake(json!({"snappy": true, "max_rdy_count": 2500}), None)
            .await;
        assert_eq!(identify["snappy"], true);

        assert_eq!(nsqd.expect("PUB test_topic").await, b"hello");
        nsqd.send(response("OK")).await;

        nsqd.expect("SUB test_topic test_channel").await;
        nsqd.send(response("OK")).await;
        nsqd.expect("RDY 2").await;

        nsqd.send(message_frame(b"0000000000000001", b"payload")).await;
        nsqd.expect("FIN 0000000000000001").await;
        nsqd.drain().await;
    });

    let mut config = ConnectionConfig::default();
    config.identify.snappy = Some(true);
    let conn = Connection::open(addr, config).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.reader_kind(), ReaderKind::Snappy);
    assert!(!conn.is_tls());

    publish_message(&conn, "test_topic", "hello").await.unwrap();
    subscribe(&conn, "test_topic", "test_channel", 2).await.unwrap();
    assert_eq!(conn.ready_count(), 2);

    let msg = conn.next_message().await.unwrap();
    info!("收到消息: {:?}", msg);
    assert_eq!(msg.body, Bytes::from_static(b"payload"));
    assert_eq!(msg.attempts, 1);
    assert_eq!(conn.remaining_credit(), 1);
    assert_eq!(conn.in_flight(), 1);

    assert_eq!(msg.fin().await.unwrap(), Bytes::from_static(b"OK"));
    assert!(msg.processed());
    assert_eq!(msg.state(), MessageState::Finished);
    assert_eq!(conn.in_flight(), 0);
    assert!(matches!(msg.fin().await, Err(Error::AlreadyProcessed)));

    conn.close().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.await.unwrap();
}

#[tokio::test]
async fn test_deflate_publish_and_requeue() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        let identify = nsqd
            .handshake(json!({"deflate": true, "deflate_level": 3}), None)
            .await;
        assert_eq!(identify["deflate"], true);
        assert_eq!(identify["deflate_level"], 3);

        assert_eq!(nsqd.expect("PUB test_topic").await, vec![b'x'; 4096]);
        nsqd.send(response("OK")).await;

        nsqd.expect("SUB test_topic test_channel").await;
        nsqd.send(response("OK")).await;
        nsqd.expect("RDY 1").await;

        nsqd.send(message_frame(b"000000000000000a", b"retry me")).await;
        nsqd.expect("TOUCH 000000000000000a").await;
        nsqd.expect("REQ 000000000000000a 1500").await;
        nsqd.drain().await;
    });

    let mut config = ConnectionConfig::default();
    config.identify.deflate = Some(true);
    config.identify.deflate_level = Some(3);
    let conn = Connection::open(addr, config).await.unwrap();
    assert_eq!(conn.reader_kind(), ReaderKind::Deflate);

    publish_message(&conn, "test_topic", vec![b'x'; 4096])
        .await
        .unwrap();
    subscribe(&conn, "test_topic", "test_channel", 1).await.unwrap();

    let msg = conn.next_message().await.unwrap();
    msg.touch().await.unwrap();
    assert!(!msg.processed());
    msg.req(Duration::from_millis(1500)).await.unwrap();
    assert!(msg.processed());
    assert_eq!(msg.state(), MessageState::Requeued);

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_negotiation_failure_closes() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({"snappy": false}), None).await;
        nsqd.drain().await;
    });

    let mut config = ConnectionConfig::default();
    config.identify.snappy = Some(true);
    let conn = Connection::connect(addr, config).await.unwrap();
    assert!(matches!(
        conn.execute(Command::Nop).await,
        Err(Error::InvalidState(ConnectionState::Connected))
    ));

    assert!(matches!(conn.identify().await, Err(Error::Negotiation(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(matches!(
        conn.execute(Command::Nop).await,
        Err(Error::ConnectionClosed)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_close_interrupts_identify() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.expect("IDENTIFY").await;
        // 不回复，直到客户端释放socket
        nsqd.drain().await;
    });

    let conn = Connection::connect(addr, ConnectionConfig::default())
        .await
        .unwrap();
    let identify = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.identify().await })
    };
    sleep(Duration::from_millis(200)).await;

    conn.close().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);

    let result = timeout(Duration::from_secs(1), identify)
        .await
        .expect("关闭后 identify 仍未返回")
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    timeout(Duration::from_secs(1), server)
        .await
        .expect("socket 没有被释放")
        .unwrap();
}

#[tokio::test]
async fn test_identify_times_out_without_reply() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.expect("IDENTIFY").await;
        nsqd.drain().await;
    });

    let config = ConnectionConfig {
        read_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let conn = Connection::connect(addr, config).await.unwrap();
    assert!(matches!(conn.identify().await, Err(Error::Timeout(_))));
    assert_eq!(conn.state(), ConnectionState::Closed);
    server.await.unwrap();
}

#[tokio::test]
async fn test_late_identify_reply_keeps_connection_closed() {
    init_logger();
    let (listener, addr) = listen().await;
    let (seen_tx, seen_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.expect("IDENTIFY").await;
        seen_tx.send(()).unwrap();
        let _ = release_rx.await;
        // 客户端可能已经断开，写失败也无所谓
        let _ = nsqd.try_send(response("OK")).await;
        nsqd.drain().await;
    });

    let conn = Connection::connect(addr, ConnectionConfig::default())
        .await
        .unwrap();
    let identify = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.identify().await })
    };
    seen_rx.await.unwrap();

    conn.close().await.unwrap();
    release_tx.send(()).unwrap();

    assert!(matches!(
        identify.await.unwrap(),
        Err(Error::ConnectionClosed)
    ));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(conn.identify_response().is_none());
    assert!(matches!(
        conn.execute(Command::Nop).await,
        Err(Error::ConnectionClosed)
    ));
    server.await.unwrap();
}

#[tokio::test]
async fn test_auth_failure_keeps_connection() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({"auth_required": true}), None).await;

        assert_eq!(nsqd.expect("AUTH").await, b"wrong");
        nsqd.send(error_frame("E_AUTH_FAILED AUTH failed")).await;

        nsqd.expect("CLS").await;
        nsqd.send(response(CLOSE_WAIT)).await;
        nsqd.drain().await;
    });

    let conn = Connection::connect(addr, ConnectionConfig::default())
        .await
        .unwrap();
    let identify = conn.identify().await.unwrap();
    assert!(identify.auth_required);
    assert_eq!(conn.state(), ConnectionState::Authenticating);

    assert!(matches!(
        conn.execute(Command::Publish("t".into(), Bytes::from_static(b"x")))
            .await,
        Err(Error::InvalidState(ConnectionState::Authenticating))
    ));

    assert!(matches!(conn.auth("wrong").await, Err(Error::AuthFailed(_))));
    assert_eq!(conn.state(), ConnectionState::Authenticating);

    let reply = conn.execute(Command::Cls).await.unwrap();
    assert_eq!(reply, CLOSE_WAIT);

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_open_authenticates_with_secret() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({"auth_required": true}), None).await;

        assert_eq!(nsqd.expect("AUTH").await, b"s3cret");
        let auth = json!({"identity": "tester", "identity_url": "", "permission_count": 2});
        nsqd.send(response(auth.to_string())).await;
        nsqd.drain().await;
    });

    let config = ConnectionConfig {
        auth_secret: Some("s3cret".to_string()),
        ..Default::default()
    };
    let conn = Connection::open(addr, config).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_close_fails_pending_command() {
    init_logger();
    let (listener, addr) = listen().await;
    let (seen_tx, seen_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({"max_rdy_count": 2500}), None).await;
        nsqd.expect("PUB slow").await;
        seen_tx.send(()).unwrap();
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();

    let pending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.execute(Command::Publish("slow".into(), Bytes::from_static(b"x")))
                .await
        })
    };
    seen_rx.await.unwrap();

    conn.close().await.unwrap();
    assert!(matches!(
        pending.await.unwrap(),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        conn.execute(Command::Nop).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(conn.next_message().await.is_none());
    assert!(conn.is_closed());

    // 重复关闭没有副作用
    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_responses_match_callers_in_order() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;
        for _ in 0..5 {
            let (_, body) = nsqd.read_command().await.unwrap();
            nsqd.send(response(body)).await;
        }
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();

    let mut handles = vec![];
    for i in 0..5 {
        let conn = conn.clone();
        handles.push(tokio::spawn(async move {
            let body = Bytes::from(format!("echo-{}", i));
            let reply = conn
                .execute(Command::Publish("fifo".into(), body.clone()))
                .await
                .unwrap();
            assert_eq!(reply, body);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_heartbeat_answered_while_command_pending() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;

        nsqd.send(response("_heartbeat_")).await;
        nsqd.expect("NOP").await;

        nsqd.expect("PUB hb").await;
        nsqd.send(response("_heartbeat_")).await;
        nsqd.expect("NOP").await;
        nsqd.send(response("OK")).await;
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();
    publish_message(&conn, "hb", "x").await.unwrap();

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_fin_failure_marks_message_timed_out() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({"max_rdy_count": 10}), None).await;

        nsqd.expect("SUB t c").await;
        nsqd.send(response("OK")).await;
        nsqd.expect("RDY 1").await;

        nsqd.send(message_frame(b"00000000000000ff", b"late")).await;
        nsqd.expect("FIN 00000000000000ff").await;
        nsqd.send(error_frame(
            "E_FIN_FAILED FIN 00000000000000ff failed ID not in flight",
        ))
        .await;

        // 确认失败不应该被当作下一个命令的响应
        nsqd.expect("PUB t").await;
        nsqd.send(response("OK")).await;
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();
    assert!(matches!(
        conn.execute(Command::Ready(11)).await,
        Err(Error::Config(_))
    ));
    subscribe(&conn, "t", "c", 1).await.unwrap();

    let msg = conn.next_message().await.unwrap();
    msg.fin().await.unwrap();
    wait_until(|| msg.timed_out()).await;
    assert_eq!(msg.state(), MessageState::TimedOut);

    publish_message(&conn, "t", "after").await.unwrap();

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_server_disconnect_drains_queue() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;
        nsqd.expect("SUB t c").await;
        nsqd.send(response("OK")).await;
        nsqd.expect("RDY 2").await;
        nsqd.send(message_frame(b"0000000000000001", b"one")).await;
        nsqd.send(message_frame(b"0000000000000002", b"two")).await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();
    subscribe(&conn, "t", "c", 2).await.unwrap();
    server.await.unwrap();

    wait_until(|| conn.is_closed()).await;
    assert_eq!(conn.next_message().await.unwrap().body, "one");
    assert_eq!(conn.next_message().await.unwrap().body, "two");
    assert!(conn.next_message().await.is_none());
}

#[tokio::test]
async fn test_unsolicited_error_is_logged_and_ignored() {
    init_logger();
    let (listener, addr) = listen().await;
    let (sent_tx, sent_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;
        nsqd.send(error_frame("E_INVALID cannot process")).await;
        sent_tx.send(()).unwrap();

        nsqd.expect("PUB t").await;
        nsqd.send(response("OK")).await;
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();
    sent_rx.await.unwrap();
    sleep(Duration::from_millis(100)).await;

    publish_message(&conn, "t", "still works").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Ready);

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_error_from_unreplied_command_not_charged_to_pending() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;

        nsqd.expect("PUB t").await;
        nsqd.send(error_frame("E_INVALID RDY count 11 out of range"))
            .await;
        nsqd.send(response("OK")).await;
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();
    let reply = conn
        .execute(Command::Publish("t".into(), Bytes::from_static(b"x")))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"OK"));
    assert_eq!(conn.state(), ConnectionState::Ready);

    conn.close().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_local_close_drains_queue() {
    init_logger();
    let (listener, addr) = listen().await;

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;
        nsqd.expect("SUB t c").await;
        nsqd.send(response("OK")).await;
        nsqd.expect("RDY 2").await;
        nsqd.send(message_frame(b"0000000000000001", b"one")).await;
        nsqd.send(message_frame(b"0000000000000002", b"two")).await;
        nsqd.drain().await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();
    subscribe(&conn, "t", "c", 2).await.unwrap();
    wait_until(|| conn.in_flight() == 2).await;

    conn.close().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);

    assert_eq!(conn.next_message().await.unwrap().body, "one");
    assert_eq!(conn.next_message().await.unwrap().body, "two");
    assert!(conn.next_message().await.is_none());
    server.await.unwrap();
}

#[tokio::test]
async fn test_cancelled_write_closes_connection() {
    init_logger();
    let (listener, addr) = listen().await;
    let (done_tx, done_rx) = oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        nsqd.handshake(json!({}), None).await;
        // 不再读取，让客户端的写阻塞
        let _ = done_rx.await;
    });

    let conn = Connection::open(addr, ConnectionConfig::default())
        .await
        .unwrap();

    let body = Bytes::from(vec![0u8; 32 * 1024 * 1024]);
    let result = timeout(
        Duration::from_millis(100),
        conn.execute(Command::Publish("big".into(), body)),
    )
    .await;
    assert!(result.is_err());

    // 命令可能只写出一部分，连接不能继续使用
    wait_until(|| conn.is_closed()).await;
    assert!(matches!(
        conn.execute(Command::Publish("t".into(), Bytes::from_static(b"x")))
            .await,
        Err(Error::ConnectionClosed)
    ));

    done_tx.send(()).unwrap();
    server.await.unwrap();
}

fn test_tls_acceptor() -> (TlsAcceptor, String) {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "nsq test ca");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    leaf_params
        .distinguished_name
        .push(DnType::CommonName, "localhost");
    let leaf = leaf_params
        .signed_by(&leaf_key, &ca_cert, &ca_key)
        .unwrap();

    let server_config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![leaf.der().clone()],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
    )
    .unwrap();

    let ca_path = std::env::temp_dir().join(format!(
        "nsq-conn-rs-test-ca-{}.pem",
        std::process::id()
    ));
    std::fs::write(&ca_path, ca_cert.pem()).unwrap();

    (
        TlsAcceptor::from(Arc::new(server_config)),
        ca_path.to_string_lossy().to_string(),
    )
}

#[tokio::test]
async fn test_tls_then_snappy() {
    init_logger();
    let (listener, addr) = listen().await;
    let (acceptor, ca_path) = test_tls_acceptor();

    let server = tokio::spawn(async move {
        let mut nsqd = MockNsqd::accept(&listener).await;
        let identify = nsqd
            .handshake(json!({"tls_v1": true, "snappy": true}), Some(acceptor))
            .await;
        assert_eq!(identify["tls_v1"], true);

        assert_eq!(nsqd.expect("PUB secure").await, b"over tls");
        nsqd.send(response("OK")).await;
        nsqd.drain().await;
    });

    let mut config = ConnectionConfig::default();
    config.identify.tls_v1 = Some(true);
    config.identify.snappy = Some(true);
    config.tls = TlsConfig {
        server_name: Some("localhost".to_string()),
        ca_cert_path: Some(ca_path),
        insecure_skip_verify: false,
    };

    let conn = Connection::open(addr, config).await.unwrap();
    assert_eq!(conn.reader_kind(), ReaderKind::Snappy);
    assert!(conn.is_tls());
    publish_message(&conn, "secure", "over tls").await.unwrap();

    conn.close().await.unwrap();
    server.await.unwrap();
}

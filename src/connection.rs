//! NSQ TCP连接
//!
//! 一个连接对应一个socket、一个后台读循环和一个按调用顺序排队的命令闸门：
//!
//! - `connect` 建立TCP连接并发送魔术字
//! - `identify` 在读循环启动之前直接读取响应，完成 TLS / 压缩的切换
//! - 之后读循环把响应交给队首的等待者，把消息放入投递队列，心跳在循环内回复 NOP

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::codec::{CommandWriter, FrameReader};
use crate::compression::{ReaderKind, StreamDecoder, StreamEncoder, DEFAULT_DEFLATE_LEVEL};
use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::message::{AckState, Message};
use crate::protocol::{
    is_response_less, AuthResponse, Command, Frame, IdentifyResponse, MessageId, Protocol,
    ProtocolError, AUTH, CLS, HEARTBEAT, MAGIC_V2, NOP, OK, RDY,
};
use crate::tls;
use crate::transport::Transport;

/// 异步确认失败的错误码，只说明某条消息已不在服务端的 in-flight 中
const ACK_FAILURE_CODES: [&str; 3] = ["E_FIN_FAILED", "E_REQ_FAILED", "E_TOUCH_FAILED"];

/// 超过这个数量时清理已经被丢弃的消息索引
const MESSAGE_INDEX_PRUNE_THRESHOLD: usize = 1024;

type Waiter = oneshot::Sender<Result<Bytes>>;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Identifying,
    NegotiatingTls,
    NegotiatingCompression,
    Authenticating,
    Ready,
    Closing,
    Closed,
}

pub(crate) struct Inner {
    addr: String,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    /// 协商阶段独占的读取器，读循环启动后为 None
    handshake: AsyncMutex<Option<FrameReader<Transport>>>,
    writer: AsyncMutex<Option<CommandWriter<WriteHalf<Transport>>>>,
    /// 命令闸门，持有期间只有一个命令在等待响应
    gate: AsyncMutex<()>,
    waiters: Mutex<VecDeque<Waiter>>,
    sender: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    queue: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    shutdown: CancellationToken,
    reader_kind: Mutex<ReaderKind>,
    tls: AtomicBool,
    identify_response: Mutex<Option<IdentifyResponse>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
    last_rdy: AtomicU32,
    credit: AtomicI64,
    in_flight: AtomicI64,
    messages: DashMap<MessageId, Weak<AckState>>,
}

/// TCP连接，克隆后共享同一个socket
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// 建立TCP连接并发送魔术字，状态变为 `Connected`
    pub async fn connect(addr: impl Into<String>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;
        let addr = addr.into();

        let mut stream = Self::connect_with_retry(&addr, &config).await?;
        stream.set_nodelay(true)?;
        timeout(config.write_timeout, stream.write_all(MAGIC_V2)).await??;
        info!("成功连接到 NSQ 服务器: {}", addr);

        let reader =
            FrameReader::new(Transport::Plain(stream)).with_max_frame_size(config.max_frame_size);
        let (sender, receiver) = mpsc::unbounded_channel();

        Ok(Self {
            inner: Arc::new(Inner {
                addr,
                config,
                state: Mutex::new(ConnectionState::Connected),
                handshake: AsyncMutex::new(Some(reader)),
                writer: AsyncMutex::new(None),
                gate: AsyncMutex::new(()),
                waiters: Mutex::new(VecDeque::new()),
                sender: Mutex::new(Some(sender)),
                queue: AsyncMutex::new(receiver),
                shutdown: CancellationToken::new(),
                reader_kind: Mutex::new(ReaderKind::Plain),
                tls: AtomicBool::new(false),
                identify_response: Mutex::new(None),
                read_task: Mutex::new(None),
                last_rdy: AtomicU32::new(0),
                credit: AtomicI64::new(0),
                in_flight: AtomicI64::new(0),
                messages: DashMap::new(),
            }),
        })
    }

    /// 连接、IDENTIFY，并在服务端要求时使用配置的密钥认证
    pub async fn open(addr: impl Into<String>, config: ConnectionConfig) -> Result<Self> {
        let secret = config.auth_secret.clone();
        let conn = Self::connect(addr, config).await?;
        let response = conn.identify().await?;

        if response.auth_required {
            let Some(secret) = secret else {
                let _ = conn.close().await;
                return Err(Error::AuthFailed("服务端要求认证，但没有配置密钥".to_string()));
            };
            if let Err(e) = conn.auth(secret).await {
                let _ = conn.close().await;
                return Err(e);
            }
        }

        Ok(conn)
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// 使用重试机制连接到NSQ服务器
    async fn connect_with_retry(addr: &str, config: &ConnectionConfig) -> Result<TcpStream> {
        let backoff = config.backoff_config.build(config.dial_timeout);
        let dial_timeout = config.dial_timeout;

        let result = backoff::future::retry_notify(
            backoff,
            || async move {
                match timeout(dial_timeout, TcpStream::connect(addr)).await {
                    Ok(Ok(stream)) => Ok(stream),
                    Ok(Err(e)) => Err(backoff::Error::transient(Error::Io(e))),
                    Err(e) => Err(backoff::Error::transient(Error::Timeout(e))),
                }
            },
            |err, duration| {
                warn!("连接到 {} 失败: {}, 将在 {:?} 后重试", addr, err, duration);
            },
        )
        .await;

        result.map_err(|e| Error::Connection(format!("无法连接到 {}: {}", addr, e)))
    }

    /// 发送IDENTIFY并完成TLS和压缩协商
    ///
    /// 请求的特性服务端没有确认时返回 `Error::Negotiation` 并关闭连接。
    pub async fn identify(&self) -> Result<IdentifyResponse> {
        self.transition(ConnectionState::Connected, ConnectionState::Identifying)?;

        let reader = self
            .inner
            .handshake
            .lock()
            .await
            .take()
            .ok_or(Error::InvalidState(ConnectionState::Identifying))?;

        match self.negotiate(reader).await {
            Ok((reader, encoder, response)) => {
                let next = if response.auth_required {
                    ConnectionState::Authenticating
                } else {
                    ConnectionState::Ready
                };
                self.start_session(reader, encoder).await?;
                *self.inner.identify_response.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(response.clone());

                // 协商期间被关闭的连接不能再回到可用状态
                if let Err(e) = self.advance(next) {
                    self.inner.finish().await;
                    return Err(e);
                }
                Ok(response)
            }
            Err(e) => {
                if matches!(e, Error::ConnectionClosed) {
                    info!("与 {} 的协商被关闭中断", self.inner.addr);
                } else {
                    error!("与 {} 协商失败: {}", self.inner.addr, e);
                }
                let _ = self.close().await;
                Err(e)
            }
        }
    }

    /// 协商阶段的一次等待，连接关闭时立即返回，超过 `read_timeout` 视为超时
    async fn handshake_step<T>(&self, step: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(Error::ConnectionClosed),
            result = timeout(self.inner.config.read_timeout, step) => result?,
        }
    }

    async fn negotiate(
        &self,
        mut reader: FrameReader<Transport>,
    ) -> Result<(FrameReader<Transport>, StreamEncoder, IdentifyResponse)> {
        let identify = &self.inner.config.identify;
        let write_timeout = self.inner.config.write_timeout;
        let bytes = Command::Identify(identify.clone()).to_bytes()?;
        self.handshake_step(async {
            let io = reader.get_mut();
            timeout(write_timeout, async {
                io.write_all(&bytes).await?;
                io.flush().await
            })
            .await??;
            Ok::<(), Error>(())
        })
        .await?;

        let data = self
            .handshake_step(read_handshake_response(&mut reader, write_timeout))
            .await?;
        let response = IdentifyResponse::parse(&data)?;
        debug!("IDENTIFY 响应: {:?}", response);

        if identify.wants_tls() {
            if !response.tls_v1 {
                return Err(Error::Negotiation("服务端未确认 TLS".to_string()));
            }
            self.advance(ConnectionState::NegotiatingTls)?;

            let buffered = reader.take_buffered();
            let max_frame_size = reader.max_frame_size();
            let (transport, decoder, buf) = reader.into_parts();
            let Transport::Plain(stream) = transport else {
                return Err(Error::Negotiation("连接已经是TLS".to_string()));
            };
            let transport = self
                .handshake_step(tls::upgrade(
                    stream,
                    buffered,
                    host_of(&self.inner.addr),
                    &self.inner.config.tls,
                ))
                .await?;
            reader = FrameReader::from_parts(transport, decoder, buf)
                .with_max_frame_size(max_frame_size);

            self.handshake_step(expect_ok(&mut reader, write_timeout))
                .await?;
            info!("与 {} 的TLS协商完成", self.inner.addr);
        }

        let mut encoder = StreamEncoder::Passthrough;
        if identify.wants_snappy() || identify.wants_deflate() {
            self.advance(ConnectionState::NegotiatingCompression)?;

            if identify.wants_snappy() {
                if !response.snappy {
                    return Err(Error::Negotiation("服务端未确认 snappy".to_string()));
                }
                reader.upgrade(StreamDecoder::snappy())?;
                encoder = StreamEncoder::snappy();
            } else {
                if !response.deflate {
                    return Err(Error::Negotiation("服务端未确认 deflate".to_string()));
                }
                let level = response
                    .deflate_level
                    .or(identify.deflate_level)
                    .and_then(|l| u32::try_from(l).ok())
                    .unwrap_or(DEFAULT_DEFLATE_LEVEL);
                reader.upgrade(StreamDecoder::deflate())?;
                encoder = StreamEncoder::deflate(level);
            }

            self.handshake_step(expect_ok(&mut reader, write_timeout))
                .await?;
            info!("与 {} 的压缩协商完成: {:?}", self.inner.addr, reader.kind());
        }

        Ok((reader, encoder, response))
    }

    /// 拆分读写两端并启动读循环
    async fn start_session(
        &self,
        reader: FrameReader<Transport>,
        encoder: StreamEncoder,
    ) -> Result<()> {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(sender) = sender else {
            return Err(Error::ConnectionClosed);
        };
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        *self.inner.reader_kind.lock().unwrap_or_else(|e| e.into_inner()) = reader.kind();

        let max_frame_size = reader.max_frame_size();
        let (transport, decoder, buf) = reader.into_parts();
        self.inner.tls.store(transport.is_tls(), Ordering::SeqCst);
        let (read_half, write_half) = tokio::io::split(transport);
        let reader: FrameReader<ReadHalf<Transport>> =
            FrameReader::from_parts(read_half, decoder, buf).with_max_frame_size(max_frame_size);

        *self.inner.writer.lock().await = Some(CommandWriter::new(
            write_half,
            encoder,
            self.inner.config.write_timeout,
        ));

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(read_loop(inner, reader, sender));
        *self.inner.read_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// 发送AUTH；密钥错误返回 `AuthFailed`，连接保持打开
    pub async fn auth(&self, secret: impl AsRef<[u8]>) -> Result<AuthResponse> {
        match self.state() {
            ConnectionState::Authenticating | ConnectionState::Ready => {}
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(Error::ConnectionClosed)
            }
            other => return Err(Error::InvalidState(other)),
        }

        let command = Command::Auth(Bytes::copy_from_slice(secret.as_ref()));
        match self.execute(command).await {
            Ok(data) => {
                let response: AuthResponse = serde_json::from_slice(&data)?;
                info!(
                    "认证成功 [identity: {}, 权限数: {}]",
                    response.identity, response.permission_count
                );
                self.advance(ConnectionState::Ready)?;
                Ok(response)
            }
            Err(Error::Command(msg)) => {
                warn!("认证失败: {}", msg);
                Err(Error::AuthFailed(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// 执行命令并返回服务端的响应
    ///
    /// 需要响应的命令按调用顺序排队，同一时刻只有一个在等待。
    /// NOP、RDY、FIN、REQ、TOUCH 服务端成功时不回复，写出后直接返回 `OK`。
    pub async fn execute(&self, command: Command) -> Result<Bytes> {
        self.check_allowed(&command)?;

        if let Some(count) = ready_count(&command) {
            self.check_ready_count(count)?;
        }

        if !command.expects_response() {
            self.write(&command).await?;
            if let Some(count) = ready_count(&command) {
                self.inner.last_rdy.store(count, Ordering::SeqCst);
                self.inner.credit.store(count as i64, Ordering::SeqCst);
            }
            return Ok(Bytes::from_static(OK));
        }

        let _gate = tokio::select! {
            guard = self.inner.gate.lock() => guard,
            _ = self.inner.shutdown.cancelled() => return Err(Error::ConnectionClosed),
        };
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        // 先登记等待者再写，避免响应先于登记到达
        let (tx, rx) = oneshot::channel();
        let pending = PendingWaiter::register(&self.inner, tx);

        if let Err(e) = self.write(&command).await {
            pending.withdraw();
            return Err(e);
        }
        pending.written();

        tokio::select! {
            result = rx => result.unwrap_or(Err(Error::ConnectionClosed)),
            _ = self.inner.shutdown.cancelled() => Err(Error::ConnectionClosed),
        }
    }

    /// 写命令，写失败时连接不可再用
    async fn write(&self, command: &Command) -> Result<()> {
        let result = self.inner.write_command(command).await;
        if let Err(e) = &result {
            if e.is_fatal() && !matches!(e, Error::ConnectionClosed) {
                error!("向 {} 写命令失败: {}", self.inner.addr, e);
                let _ = self.close().await;
            }
        }
        result
    }

    fn check_allowed(&self, command: &Command) -> Result<()> {
        if matches!(command, Command::Identify(_)) {
            return Err(Error::InvalidState(self.state()));
        }

        let name = command.name();
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::Authenticating
                if [AUTH, NOP, CLS]
                    .iter()
                    .any(|c| c.as_bytes().eq_ignore_ascii_case(name)) =>
            {
                Ok(())
            }
            ConnectionState::Closing | ConnectionState::Closed => Err(Error::ConnectionClosed),
            other => Err(Error::InvalidState(other)),
        }
    }

    fn check_ready_count(&self, count: u32) -> Result<()> {
        let max = self
            .identify_response()
            .and_then(|r| r.max_rdy_count)
            .unwrap_or(i64::MAX);
        if count as i64 > max {
            return Err(Error::Config(format!(
                "RDY {} 超过服务端上限 {}",
                count, max
            )));
        }
        Ok(())
    }

    /// 等待下一条消息；连接关闭且已排队的消息取完后返回 None
    pub async fn next_message(&self) -> Option<Message> {
        self.inner.queue.lock().await.recv().await
    }

    /// 不等待地取一条已经到达的消息
    pub fn try_next_message(&self) -> Option<Message> {
        self.inner.queue.try_lock().ok()?.try_recv().ok()
    }

    /// 关闭连接：立即让所有等待中的命令失败，已排队的消息仍可取出
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return Ok(());
            }
            *state = ConnectionState::Closing;
        }
        info!("正在关闭到 {} 的连接", self.inner.addr);

        self.inner.shutdown.cancel();
        self.inner.fail_waiters();
        self.inner
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("关闭写端出错: {}", e);
            }
        }
        self.inner.handshake.lock().await.take();

        let handle = self
            .inner
            .read_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner.set_state(ConnectionState::Closed);
        Ok(())
    }

    /// 获取连接的地址
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// 当前生效的读取器类型
    pub fn reader_kind(&self) -> ReaderKind {
        *self.inner.reader_kind.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn identify_response(&self) -> Option<IdentifyResponse> {
        self.inner
            .identify_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// 是否已经升级为TLS
    pub fn is_tls(&self) -> bool {
        self.inner.tls.load(Ordering::SeqCst)
    }

    /// 最近一次发送的RDY
    pub fn ready_count(&self) -> u32 {
        self.inner.last_rdy.load(Ordering::SeqCst)
    }

    /// 距离最近一次RDY还剩的投递额度
    pub fn remaining_credit(&self) -> i64 {
        self.inner.credit.load(Ordering::SeqCst)
    }

    /// 已投递但尚未 FIN/REQ 的消息数
    pub fn in_flight(&self) -> i64 {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn message_settled(&self) {
        let _ = self
            .inner
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some((n - 1).max(0)));
    }

    /// 推进状态，连接已经关闭时返回 `ConnectionClosed`
    fn advance(&self, next: ConnectionState) -> Result<()> {
        if self.inner.set_state(next) {
            Ok(())
        } else {
            Err(Error::ConnectionClosed)
        }
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            s if s == from => {
                debug!("连接状态 {:?} -> {:?}", s, to);
                *state = to;
                Ok(())
            }
            ConnectionState::Closing | ConnectionState::Closed => Err(Error::ConnectionClosed),
            other => Err(Error::InvalidState(other)),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.inner.addr)
            .field("state", &self.state())
            .field("reader", &self.reader_kind())
            .finish()
    }
}

impl Inner {
    /// 关闭之后只允许进入 `Closed`
    fn set_state(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let closing = matches!(*state, ConnectionState::Closing | ConnectionState::Closed);
        if closing && next != ConnectionState::Closed {
            return false;
        }
        if *state != next {
            debug!("连接状态 {:?} -> {:?}", *state, next);
            *state = next;
        }
        true
    }

    fn push_waiter(&self, waiter: Waiter) {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(waiter);
    }

    fn pop_waiter(&self) -> Option<Waiter> {
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn fail_waiters(&self) {
        let waiters: Vec<Waiter> = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }

    async fn write_command(&self, command: &Command) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::ConnectionClosed)?;
        writer.write_command(command).await
    }

    /// 处理读循环收到的一个帧
    async fn dispatch(
        self: &Arc<Self>,
        frame: Frame,
        sender: &mpsc::UnboundedSender<Message>,
    ) -> Result<()> {
        match frame {
            Frame::Response(data) if data == HEARTBEAT => {
                debug!("收到 {} 的心跳", self.addr);
                self.write_command(&Command::Nop).await?;
            }
            Frame::Response(data) => match self.pop_waiter() {
                Some(waiter) => {
                    let _ = waiter.send(Ok(data));
                }
                None => warn!(
                    "收到没有对应命令的响应: {:?}",
                    String::from_utf8_lossy(&data)
                ),
            },
            Frame::Error(data) => {
                let (code, desc) = Protocol::split_error(&data);
                let text = String::from_utf8_lossy(&data).to_string();

                if ACK_FAILURE_CODES.contains(&code.as_str()) {
                    warn!("NSQ确认失败: {}", text);
                    self.mark_timed_out(&desc);
                    return Ok(());
                }

                // 描述以命令名开头，不回复的命令出错时不能算到等待中的命令上
                let source = desc.split_whitespace().next().unwrap_or_default();
                if is_response_less(source.as_bytes()) {
                    warn!("{} 命令执行失败: {}", source, text);
                    return Ok(());
                }

                match self.pop_waiter() {
                    Some(waiter) => {
                        let _ = waiter.send(Err(Error::Command(text)));
                    }
                    None => error!("NSQ错误: {}", text),
                }
            }
            Frame::Message(frame) => {
                let remaining = self.credit.fetch_sub(1, Ordering::SeqCst);
                if remaining <= 0 {
                    warn!(
                        "{} 投递超过了 RDY {} 的额度",
                        self.addr,
                        self.last_rdy.load(Ordering::SeqCst)
                    );
                    self.credit.store(0, Ordering::SeqCst);
                }
                self.in_flight.fetch_add(1, Ordering::SeqCst);

                let message = Message::new(frame, Arc::downgrade(self));
                debug!(
                    "收到消息 [ID: {}, 尝试次数: {}, 时间戳: {}]",
                    message.id, message.attempts, message.timestamp
                );
                if self.messages.len() >= MESSAGE_INDEX_PRUNE_THRESHOLD {
                    self.messages.retain(|_, state| state.strong_count() > 0);
                }
                self.messages.insert(message.id, message.ack_state());

                if sender.send(message).is_err() {
                    debug!("投递队列已关闭，丢弃消息");
                }
            }
        }
        Ok(())
    }

    /// 根据 `FIN <id> failed ...` 标记对应消息超时
    fn mark_timed_out(&self, desc: &str) {
        let Some(id) = desc.split_whitespace().nth(1) else {
            return;
        };
        let Ok(id) = MessageId::try_from(id.as_bytes()) else {
            return;
        };
        if let Some((_, state)) = self.messages.remove(&id) {
            if let Some(state) = state.upgrade() {
                state.mark_timed_out();
            }
        }
    }

    /// 读循环结束后的清理
    async fn finish(&self) {
        self.set_state(ConnectionState::Closed);
        self.shutdown.cancel();
        self.fail_waiters();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}

/// 已登记但命令还没写完的等待者
///
/// 写出过程中被丢弃时撤回登记。命令可能只写出了一部分，连接随之关闭。
struct PendingWaiter<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl<'a> PendingWaiter<'a> {
    fn register(inner: &'a Inner, waiter: Waiter) -> Self {
        inner.push_waiter(waiter);
        Self { inner, armed: true }
    }

    fn written(mut self) {
        self.armed = false;
    }

    fn withdraw(mut self) {
        self.inner.pop_waiter();
        self.armed = false;
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.pop_waiter();
        if !self.inner.shutdown.is_cancelled() {
            warn!("{} 的命令在写出过程中被取消，关闭连接", self.inner.addr);
            self.inner.shutdown.cancel();
        }
    }
}

/// 读取协商阶段的响应帧，期间的心跳直接回复
async fn read_handshake_response(
    reader: &mut FrameReader<Transport>,
    write_timeout: std::time::Duration,
) -> Result<Bytes> {
    loop {
        match reader.read_frame().await? {
            Frame::Response(data) if data == HEARTBEAT => {
                let nop = Command::Nop.to_bytes()?;
                timeout(write_timeout, reader.get_mut().write_all(&nop)).await??;
            }
            Frame::Response(data) => return Ok(data),
            Frame::Error(data) => {
                return Err(Error::Command(String::from_utf8_lossy(&data).to_string()))
            }
            Frame::Message(_) => {
                return Err(Error::Protocol(ProtocolError::Other(
                    "协商阶段收到消息帧".to_string(),
                )))
            }
        }
    }
}

async fn expect_ok(
    reader: &mut FrameReader<Transport>,
    write_timeout: std::time::Duration,
) -> Result<()> {
    let data = read_handshake_response(reader, write_timeout).await?;
    if data != OK {
        return Err(Error::Negotiation(format!(
            "期望 OK，收到 {:?}",
            String::from_utf8_lossy(&data)
        )));
    }
    Ok(())
}

/// 读循环：直到连接关闭、协议错误或被取消
async fn read_loop(
    inner: Arc<Inner>,
    mut reader: FrameReader<ReadHalf<Transport>>,
    sender: mpsc::UnboundedSender<Message>,
) {
    let reason = loop {
        let frame = tokio::select! {
            _ = inner.shutdown.cancelled() => break None,
            frame = reader.read_frame() => frame,
        };

        let result = match frame {
            Ok(frame) => inner.dispatch(frame, &sender).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            break Some(e);
        }
    };

    match reason {
        None => debug!("{} 的读循环已停止", inner.addr),
        Some(Error::ConnectionClosed) => info!("{} 的连接已关闭", inner.addr),
        Some(e) => error!("{} 的读循环出错: {}", inner.addr, e),
    }

    drop(sender);
    inner.finish().await;
}

/// 从命令中取出RDY数量
fn ready_count(command: &Command) -> Option<u32> {
    match command {
        Command::Ready(count) => Some(*count),
        Command::Custom { name, params, .. } if name.eq_ignore_ascii_case(RDY.as_bytes()) => {
            std::str::from_utf8(params.first()?).ok()?.parse().ok()
        }
        _ => None,
    }
}

/// 取地址中的主机部分，用于TLS的SNI
fn host_of(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}

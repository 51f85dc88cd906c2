use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::debug;

use crate::connection::{Connection, Inner};
use crate::error::{Error, Result};
use crate::protocol::{Command, MessageFrame, MessageId};

const DELIVERED: u8 = 0;
const FINISHED: u8 = 1;
const REQUEUED: u8 = 2;

/// 消息的确认状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// 已投递，尚未确认
    Delivered,
    /// 已发送 FIN
    Finished,
    /// 已发送 REQ
    Requeued,
    /// 服务端报告消息已超时
    TimedOut,
}

/// 同一条消息的所有克隆共享的确认状态
#[derive(Debug, Default)]
pub(crate) struct AckState {
    outcome: AtomicU8,
    timed_out: AtomicBool,
}

impl AckState {
    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }
}

/// 投递给消费者的一条消息
///
/// 克隆共享同一个确认状态，FIN 和 REQ 只有一次能成功。
#[derive(Clone)]
pub struct Message {
    /// 唯一消息ID
    pub id: MessageId,
    /// 消息时间戳(纳秒)
    pub timestamp: u64,
    /// 消息尝试次数
    pub attempts: u16,
    /// 消息体
    pub body: Bytes,
    state: Arc<AckState>,
    conn: Weak<Inner>,
}

impl Message {
    pub(crate) fn new(frame: MessageFrame, conn: Weak<Inner>) -> Self {
        Self {
            id: frame.id,
            timestamp: frame.timestamp,
            attempts: frame.attempts,
            body: frame.body,
            state: Arc::new(AckState::default()),
            conn,
        }
    }

    pub(crate) fn ack_state(&self) -> Weak<AckState> {
        Arc::downgrade(&self.state)
    }

    /// 是否已经发出过 FIN 或 REQ
    pub fn processed(&self) -> bool {
        self.state.outcome.load(Ordering::SeqCst) != DELIVERED
    }

    /// 服务端是否报告过该消息超时
    pub fn timed_out(&self) -> bool {
        self.state.timed_out.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> MessageState {
        if self.timed_out() {
            return MessageState::TimedOut;
        }
        match self.state.outcome.load(Ordering::SeqCst) {
            FINISHED => MessageState::Finished,
            REQUEUED => MessageState::Requeued,
            _ => MessageState::Delivered,
        }
    }

    /// 完成消息
    pub async fn fin(&self) -> Result<Bytes> {
        let conn = self.settle(FINISHED)?;
        conn.execute(Command::Finish(self.id)).await
    }

    /// 重新入队，`delay` 之后再次投递
    ///
    /// REQ 同样结束客户端这边的生命周期，之后 `processed()` 为 true。
    pub async fn req(&self, delay: Duration) -> Result<Bytes> {
        let conn = self.settle(REQUEUED)?;
        let delay_ms = u32::try_from(delay.as_millis()).unwrap_or(u32::MAX);
        conn.execute(Command::Requeue(self.id, delay_ms)).await
    }

    /// 重置服务端的消息超时，可以重复调用
    pub async fn touch(&self) -> Result<Bytes> {
        if self.timed_out() {
            return Err(Error::MessageTimedOut);
        }
        if self.processed() {
            return Err(Error::AlreadyProcessed);
        }
        let conn = self.connection()?;
        conn.execute(Command::Touch(self.id)).await
    }

    /// 进入终止状态，只有第一次调用成功
    fn settle(&self, outcome: u8) -> Result<Connection> {
        if self.timed_out() {
            return Err(Error::MessageTimedOut);
        }
        self.state
            .outcome
            .compare_exchange(DELIVERED, outcome, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyProcessed)?;

        let conn = self.connection()?;
        conn.message_settled();
        debug!("消息 {} 进入状态 {:?}", self.id, self.state());
        Ok(conn)
    }

    fn connection(&self) -> Result<Connection> {
        self.conn
            .upgrade()
            .map(Connection::from_inner)
            .ok_or(Error::ConnectionClosed)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("state", &self.state())
            .finish()
    }
}

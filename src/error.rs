use std::io;
use thiserror::Error;
use tokio::time::error::Elapsed;

use crate::connection::ConnectionState;
use crate::protocol::ProtocolError;

/// NSQ连接库错误类型
#[derive(Debug, Error)]
pub enum Error {
    /// IO错误
    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialize(#[from] serde_json::Error),

    /// 建立连接失败
    #[error("连接错误: {0}")]
    Connection(String),

    /// 连接已被对端或本地关闭，不会在内部重试
    #[error("连接已关闭")]
    ConnectionClosed,

    /// 协议错误，连接随之关闭
    #[error("协议错误: {0}")]
    Protocol(#[from] ProtocolError),

    /// 服务端对某个命令返回了错误帧，连接仍然可用
    #[error("命令错误: {0}")]
    Command(String),

    /// 认证错误
    #[error("认证失败: {0}")]
    AuthFailed(String),

    /// 消息已经被 FIN 或 REQ 过
    #[error("消息已处理")]
    AlreadyProcessed,

    /// 服务端报告消息已超时
    #[error("消息已超时")]
    MessageTimedOut,

    /// TLS或压缩协商失败，连接随之关闭
    #[error("协商失败: {0}")]
    Negotiation(String),

    /// 当前连接状态不允许该操作
    #[error("连接状态 {0:?} 不允许该操作")]
    InvalidState(ConnectionState),

    /// 超时错误
    #[error("操作超时")]
    Timeout(#[from] Elapsed),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl Error {
    /// 是否为会导致连接关闭的致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectionClosed
                | Error::Protocol(_)
                | Error::Negotiation(_)
                | Error::Timeout(_)
        )
    }
}

/// Result类型别名，用于NSQ连接库
pub type Result<T> = std::result::Result<T, Error>;

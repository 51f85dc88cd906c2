// Rust NSQ连接库
// 负责单个nsqd连接上的协议协商、帧收发和消息确认

// 导出模块
pub mod codec;
pub mod commands;
pub mod compression;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod tls;
pub mod transport;

// 重导出常用类型
pub use compression::ReaderKind;
pub use config::{BackoffConfig, ConnectionConfig};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, Result};
pub use message::{Message, MessageState};
pub use protocol::{
    AuthResponse, Command, Frame, IdentifyConfig, IdentifyResponse, MessageId, Protocol,
    ProtocolError,
};
pub use tls::TlsConfig;

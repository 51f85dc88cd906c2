use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::error::{Error, Result};

/// NSQ协议常量
pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";
pub const FRAME_TYPE_RESPONSE: i32 = 0;
pub const FRAME_TYPE_ERROR: i32 = 1;
pub const FRAME_TYPE_MESSAGE: i32 = 2;

/// 帧头: 4字节大小 + 4字节类型
pub const FRAME_HEADER_SIZE: usize = 8;
/// 消息ID长度
pub const MESSAGE_ID_SIZE: usize = 16;
/// 消息头: 8字节时间戳 + 2字节尝试次数 + 16字节ID
pub const MESSAGE_HEADER_SIZE: usize = 8 + 2 + MESSAGE_ID_SIZE;
/// 默认允许的最大帧
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Common NSQ commands
pub const IDENTIFY: &str = "IDENTIFY";
pub const SUB: &str = "SUB";
pub const PUB: &str = "PUB";
pub const DPUB: &str = "DPUB";
pub const MPUB: &str = "MPUB";
pub const RDY: &str = "RDY";
pub const FIN: &str = "FIN";
pub const REQ: &str = "REQ";
pub const TOUCH: &str = "TOUCH";
pub const CLS: &str = "CLS";
pub const NOP: &str = "NOP";
pub const AUTH: &str = "AUTH";

/// nsqd 成功时不回复的命令
const NO_RESPONSE_COMMANDS: [&str; 5] = [NOP, RDY, FIN, REQ, TOUCH];

/// 服务端成功时不回复的命令名，不区分大小写
pub fn is_response_less(name: &[u8]) -> bool {
    NO_RESPONSE_COMMANDS
        .iter()
        .any(|c| c.as_bytes().eq_ignore_ascii_case(name))
}

/// 16字节的消息ID，nsqd 生成的是可打印的十六进制ASCII
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_SIZE]);

impl MessageId {
    pub fn new(bytes: [u8; MESSAGE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_SIZE] {
        &self.0
    }
}

impl TryFrom<&[u8]> for MessageId {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self> {
        let bytes: [u8; MESSAGE_ID_SIZE] = value.try_into().map_err(|_| {
            Error::Protocol(ProtocolError::InvalidMessage(format!(
                "消息ID长度应为 {} 字节，实际 {}",
                MESSAGE_ID_SIZE,
                value.len()
            )))
        })?;
        Ok(Self(bytes))
    }
}

impl AsRef<[u8]> for MessageId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", self)
    }
}

/// 命令类型枚举
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// 标识客户端身份并协商特性
    Identify(IdentifyConfig),
    /// 订阅主题和频道
    Subscribe(String, String),
    /// 发布消息到主题
    Publish(String, Bytes),
    /// 延迟发布消息到主题(毫秒)
    DelayedPublish(String, Bytes, u32),
    /// 批量发布消息到主题
    Mpublish(String, Vec<Bytes>),
    /// 设置投递额度
    Ready(u32),
    /// 完成处理消息
    Finish(MessageId),
    /// 重新入队消息(毫秒)
    Requeue(MessageId, u32),
    /// 重置消息在服务端的超时
    Touch(MessageId),
    /// 心跳回应
    Nop,
    /// 清理和关闭连接
    Cls,
    /// 认证
    Auth(Bytes),
    /// 任意命令，参数可以是文本或原始字节
    Custom {
        name: Bytes,
        params: Vec<Bytes>,
        body: Option<Bytes>,
    },
}

impl Command {
    /// 构造自定义命令，文本和字节形式的参数统一转换为字节
    pub fn custom<N, P, I>(name: N, params: I, body: Option<Bytes>) -> Self
    where
        N: AsRef<[u8]>,
        P: AsRef<[u8]>,
        I: IntoIterator<Item = P>,
    {
        Command::Custom {
            name: Bytes::copy_from_slice(name.as_ref()),
            params: params
                .into_iter()
                .map(|p| Bytes::copy_from_slice(p.as_ref()))
                .collect(),
            body,
        }
    }

    /// 命令名
    pub fn name(&self) -> &[u8] {
        match self {
            Command::Identify(_) => IDENTIFY.as_bytes(),
            Command::Subscribe(..) => SUB.as_bytes(),
            Command::Publish(..) => PUB.as_bytes(),
            Command::DelayedPublish(..) => DPUB.as_bytes(),
            Command::Mpublish(..) => MPUB.as_bytes(),
            Command::Ready(_) => RDY.as_bytes(),
            Command::Finish(_) => FIN.as_bytes(),
            Command::Requeue(..) => REQ.as_bytes(),
            Command::Touch(_) => TOUCH.as_bytes(),
            Command::Nop => NOP.as_bytes(),
            Command::Cls => CLS.as_bytes(),
            Command::Auth(_) => AUTH.as_bytes(),
            Command::Custom { name, .. } => &name[..],
        }
    }

    /// 服务端是否会对该命令回复一个帧
    pub fn expects_response(&self) -> bool {
        !is_response_less(self.name())
    }

    /// 将命令转换为字节以便发送
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Command::Identify(config) => {
                buf.extend_from_slice(b"IDENTIFY\n");
                let json = serde_json::to_vec(config)?;
                write_body(&mut buf, &json)?;
            }
            Command::Subscribe(topic, channel) => {
                buf = Protocol::write_command(
                    SUB.as_bytes(),
                    &[topic.as_bytes(), channel.as_bytes()],
                );
            }
            Command::Publish(topic, body) => {
                buf = Protocol::write_command(PUB.as_bytes(), &[topic.as_bytes()]);
                write_body(&mut buf, body)?;
            }
            Command::DelayedPublish(topic, body, delay) => {
                let delay = delay.to_string();
                buf = Protocol::write_command(
                    DPUB.as_bytes(),
                    &[topic.as_bytes(), delay.as_bytes()],
                );
                write_body(&mut buf, body)?;
            }
            Command::Mpublish(topic, bodies) => {
                buf = Protocol::write_command(MPUB.as_bytes(), &[topic.as_bytes()]);

                // 总大小: 4字节(消息数量) + 每个消息的(4字节大小 + 内容)
                let total_size = 4 + bodies.iter().map(|b| 4 + b.len()).sum::<usize>();

                buf.write_u32::<BigEndian>(total_size as u32)?;
                buf.write_u32::<BigEndian>(bodies.len() as u32)?;
                for body in bodies {
                    write_body(&mut buf, body)?;
                }
            }
            Command::Ready(count) => {
                let count = count.to_string();
                buf = Protocol::write_command(RDY.as_bytes(), &[count.as_bytes()]);
            }
            Command::Finish(id) => {
                buf = Protocol::write_command(FIN.as_bytes(), &[id.as_ref()]);
            }
            Command::Requeue(id, delay) => {
                let delay = delay.to_string();
                buf = Protocol::write_command(REQ.as_bytes(), &[id.as_ref(), delay.as_bytes()]);
            }
            Command::Touch(id) => {
                buf = Protocol::write_command(TOUCH.as_bytes(), &[id.as_ref()]);
            }
            Command::Nop => {
                buf.extend_from_slice(b"NOP\n");
            }
            Command::Cls => {
                buf.extend_from_slice(b"CLS\n");
            }
            Command::Auth(secret) => {
                buf.extend_from_slice(b"AUTH\n");
                write_body(&mut buf, secret)?;
            }
            Command::Custom { name, params, body } => {
                let params: Vec<&[u8]> = params.iter().map(|p| p.as_ref()).collect();
                buf = Protocol::write_command(name, &params);
                if let Some(body) = body {
                    write_body(&mut buf, body)?;
                }
            }
        }

        Ok(buf)
    }
}

fn write_body(buf: &mut Vec<u8>, body: &[u8]) -> Result<()> {
    buf.write_u32::<BigEndian>(body.len() as u32)?;
    buf.extend_from_slice(body);
    Ok(())
}

/// IDENTIFY命令的配置
///
/// 所有字段为 `None` 时不会出现在JSON中，由服务端取默认值。
/// 反序列化时拒绝未知字段。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct IdentifyConfig {
    /// 客户端标识，默认为hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// 客户端主机名
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// 是否期望服务端返回JSON特性文档
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_negotiation: Option<bool>,

    /// 心跳间隔(毫秒)，-1 关闭心跳
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<i32>,

    /// 输出缓冲大小
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_buffer_size: Option<i32>,

    /// 输出缓冲超时(毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_buffer_timeout: Option<i32>,

    /// TLS设置
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_v1: Option<bool>,

    /// snappy压缩，与deflate互斥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snappy: Option<bool>,

    /// deflate压缩，与snappy互斥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deflate: Option<bool>,

    /// deflate压缩级别 1-9
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deflate_level: Option<i32>,

    /// 投递采样率 0-99
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<i32>,

    /// 用户代理
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    /// 消息超时(毫秒)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_timeout: Option<i32>,
}

impl Default for IdentifyConfig {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            client_id: Some(hostname.clone()),
            hostname: Some(hostname),
            feature_negotiation: Some(true),
            heartbeat_interval: Some(30000),
            output_buffer_size: Some(16384),
            output_buffer_timeout: Some(250),
            tls_v1: None,
            snappy: None,
            deflate: None,
            deflate_level: None,
            sample_rate: None,
            user_agent: Some(format!("nsq-conn-rs/{}", env!("CARGO_PKG_VERSION"))),
            msg_timeout: Some(60000),
        }
    }
}

impl IdentifyConfig {
    pub fn wants_tls(&self) -> bool {
        self.tls_v1.unwrap_or(false)
    }

    pub fn wants_snappy(&self) -> bool {
        self.snappy.unwrap_or(false)
    }

    pub fn wants_deflate(&self) -> bool {
        self.deflate.unwrap_or(false)
    }

    /// 检查互斥和取值范围
    pub fn validate(&self) -> Result<()> {
        if self.wants_snappy() && self.wants_deflate() {
            return Err(Error::Config("snappy 与 deflate 不能同时开启".to_string()));
        }
        if let Some(level) = self.deflate_level {
            if !(1..=9).contains(&level) {
                return Err(Error::Config(format!(
                    "deflate_level 必须在 1-9 之间: {}",
                    level
                )));
            }
        }
        if let Some(rate) = self.sample_rate {
            if !(0..=99).contains(&rate) {
                return Err(Error::Config(format!(
                    "sample_rate 必须在 0-99 之间: {}",
                    rate
                )));
            }
        }
        let negotiates = self.feature_negotiation.unwrap_or(false);
        if !negotiates && (self.wants_tls() || self.wants_snappy() || self.wants_deflate()) {
            return Err(Error::Config(
                "TLS和压缩需要开启 feature_negotiation".to_string(),
            ));
        }
        Ok(())
    }
}

/// 服务端对IDENTIFY返回的特性文档
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentifyResponse {
    pub max_rdy_count: Option<i64>,
    pub version: Option<String>,
    pub max_msg_timeout: Option<i64>,
    pub msg_timeout: Option<i64>,
    pub tls_v1: bool,
    pub deflate: bool,
    pub deflate_level: Option<i32>,
    pub max_deflate_level: Option<i32>,
    pub snappy: bool,
    pub sample_rate: Option<i32>,
    pub auth_required: bool,
    pub output_buffer_size: Option<i64>,
    pub output_buffer_timeout: Option<i64>,
}

impl IdentifyResponse {
    /// 解析IDENTIFY响应，`OK` 表示服务端没有做特性协商
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data == OK {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(data)?)
    }
}

/// AUTH成功后的响应
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthResponse {
    pub identity: String,
    pub identity_url: String,
    pub permission_count: i64,
}

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// 响应
    Response,
    /// 错误
    Error,
    /// 消息
    Message,
}

impl TryFrom<i32> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: i32) -> std::result::Result<Self, ProtocolError> {
        match value {
            FRAME_TYPE_RESPONSE => Ok(FrameType::Response),
            FRAME_TYPE_ERROR => Ok(FrameType::Error),
            FRAME_TYPE_MESSAGE => Ok(FrameType::Message),
            _ => Err(ProtocolError::InvalidFrameType(value)),
        }
    }
}

impl From<FrameType> for i32 {
    fn from(value: FrameType) -> Self {
        match value {
            FrameType::Response => FRAME_TYPE_RESPONSE,
            FrameType::Error => FRAME_TYPE_ERROR,
            FrameType::Message => FRAME_TYPE_MESSAGE,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(u32),
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(i32),
    #[error("Invalid message: {0}")]
    InvalidMessage(String),
    #[error("Snappy stream error: {0}")]
    Snappy(String),
    #[error("Deflate stream error: {0}")]
    Deflate(String),
    #[error("Protocol error: {0}")]
    Other(String),
}

/// 消息帧的解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct MessageFrame {
    /// 纳秒时间戳
    pub timestamp: u64,
    /// 投递次数
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(MessageFrame),
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Response(_) => FrameType::Response,
            Frame::Error(_) => FrameType::Error,
            Frame::Message(_) => FrameType::Message,
        }
    }

    /// 由帧类型和负载构造帧
    pub fn decode(frame_type: FrameType, payload: Bytes) -> std::result::Result<Self, ProtocolError> {
        match frame_type {
            FrameType::Response => Ok(Frame::Response(payload)),
            FrameType::Error => Ok(Frame::Error(payload)),
            FrameType::Message => Protocol::decode_message(payload).map(Frame::Message),
        }
    }

    /// 编码成完整的线上格式(含大小和类型)
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Frame::Response(data) | Frame::Error(data) => payload.extend_from_slice(data),
            Frame::Message(msg) => {
                payload.put_u64(msg.timestamp);
                payload.put_u16(msg.attempts);
                payload.extend_from_slice(msg.id.as_ref());
                payload.extend_from_slice(&msg.body);
            }
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32((payload.len() + 4) as u32);
        buf.put_i32(self.frame_type().into());
        buf.extend_from_slice(&payload);
        buf.freeze()
    }
}

pub struct Protocol;

impl Protocol {
    /// 写命令行: `<cmd> <param> <param>\n`
    pub fn write_command(cmd: &[u8], params: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(cmd);

        for param in params {
            buf.push(b' ');
            buf.extend_from_slice(param);
        }

        buf.push(b'\n');
        buf
    }

    pub fn decode_message(data: Bytes) -> std::result::Result<MessageFrame, ProtocolError> {
        if data.len() < MESSAGE_HEADER_SIZE {
            return Err(ProtocolError::InvalidMessage(format!(
                "消息大小不足: {} 字节",
                data.len()
            )));
        }

        let timestamp = BigEndian::read_u64(&data[0..8]);
        let attempts = BigEndian::read_u16(&data[8..10]);
        let mut id = [0u8; MESSAGE_ID_SIZE];
        id.copy_from_slice(&data[10..MESSAGE_HEADER_SIZE]);
        let body = data.slice(MESSAGE_HEADER_SIZE..);

        Ok(MessageFrame {
            timestamp,
            attempts,
            id: MessageId(id),
            body,
        })
    }

    /// 解析错误帧，返回 (错误码, 描述)，例如 `E_FIN_FAILED FIN 0a... failed`
    pub fn split_error(data: &[u8]) -> (String, String) {
        let text = String::from_utf8_lossy(data);
        match text.split_once(' ') {
            Some((code, rest)) => (code.to_string(), rest.to_string()),
            None => (text.to_string(), String::new()),
        }
    }
}

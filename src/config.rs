use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};

use crate::error::{Error, Result};
use crate::protocol::{IdentifyConfig, DEFAULT_MAX_FRAME_SIZE};
use crate::tls::TlsConfig;

/// 连接配置
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// IDENTIFY 发送的客户端特性
    pub identify: IdentifyConfig,
    /// 认证密钥，服务端要求认证时由 `Connection::open` 自动发送
    pub auth_secret: Option<String>,
    /// TLS设置，只在 `identify.tls_v1` 开启时使用
    pub tls: TlsConfig,
    /// 拨号超时，包含重试时间
    pub dial_timeout: Duration,
    /// 单次写超时
    pub write_timeout: Duration,
    /// 协商阶段等待单个响应的超时
    pub read_timeout: Duration,
    /// 允许的最大帧
    pub max_frame_size: usize,
    /// 拨号重试策略
    pub backoff_config: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            identify: IdentifyConfig::default(),
            auth_secret: None,
            tls: TlsConfig::default(),
            dial_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(60),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            backoff_config: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        self.identify.validate()?;
        if self.max_frame_size < 8 {
            return Err(Error::Config(format!(
                "max_frame_size 过小: {}",
                self.max_frame_size
            )));
        }
        if self.write_timeout.is_zero() {
            return Err(Error::Config("write_timeout 不能为0".to_string()));
        }
        if self.read_timeout.is_zero() {
            return Err(Error::Config("read_timeout 不能为0".to_string()));
        }
        Ok(())
    }
}

/// 重连策略配置
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// 初始间隔
    pub initial_interval: Duration,
    /// 最大间隔
    pub max_interval: Duration,
    /// 倍数
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// 按总时长 `max_elapsed` 构造退避策略
    pub fn build(&self, max_elapsed: Duration) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(self.multiplier)
            .with_max_elapsed_time(Some(max_elapsed))
            .build()
    }
}

use std::time::Duration;

use bytes::Bytes;
use log::info;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::protocol::{Command, OK};

/// 创建到NSQ服务器的连接，完成IDENTIFY和认证
pub async fn create_nsqd_connection(
    nsqd_addr: impl Into<String>,
    config: ConnectionConfig,
) -> Result<Connection> {
    Connection::open(nsqd_addr, config).await
}

/// 向NSQ主题发布消息
pub async fn publish_message(
    connection: &Connection,
    topic: &str,
    message: impl Into<Bytes>,
) -> Result<()> {
    info!("向主题 {} 发布消息", topic);
    let response = connection
        .execute(Command::Publish(topic.to_string(), message.into()))
        .await?;
    expect_ok("PUB", &response)
}

/// 延迟发布消息
pub async fn delayed_publish_message(
    connection: &Connection,
    topic: &str,
    message: impl Into<Bytes>,
    delay: Duration,
) -> Result<()> {
    let delay_ms = u32::try_from(delay.as_millis())
        .map_err(|_| Error::Config(format!("延迟时间过长: {:?}", delay)))?;
    info!("向主题 {} 延迟 {}ms 发布消息", topic, delay_ms);
    let response = connection
        .execute(Command::DelayedPublish(
            topic.to_string(),
            message.into(),
            delay_ms,
        ))
        .await?;
    expect_ok("DPUB", &response)
}

/// 批量向NSQ主题发布消息
pub async fn mpublish_messages<T: Into<Bytes>>(
    connection: &Connection,
    topic: &str,
    messages: Vec<T>,
) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }

    info!("向主题 {} 批量发布 {} 条消息", topic, messages.len());
    let messages = messages.into_iter().map(Into::into).collect();
    let response = connection
        .execute(Command::Mpublish(topic.to_string(), messages))
        .await?;
    expect_ok("MPUB", &response)
}

/// 订阅主题并设置初始RDY
pub async fn subscribe(
    connection: &Connection,
    topic: &str,
    channel: &str,
    ready_count: u32,
) -> Result<()> {
    info!("订阅主题 {}, 频道 {}", topic, channel);
    let response = connection
        .execute(Command::Subscribe(topic.to_string(), channel.to_string()))
        .await?;
    expect_ok("SUB", &response)?;

    info!("成功订阅");
    connection.execute(Command::Ready(ready_count)).await?;
    Ok(())
}

fn expect_ok(command: &str, response: &[u8]) -> Result<()> {
    if response == OK {
        Ok(())
    } else {
        Err(Error::Command(format!(
            "{} 收到意外响应: {}",
            command,
            String::from_utf8_lossy(response)
        )))
    }
}

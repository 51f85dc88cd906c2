use std::time::Duration;

use log::{info, warn, LevelFilter};
use nsq_conn_rs::commands::{
    create_nsqd_connection, delayed_publish_message, mpublish_messages, publish_message,
    subscribe,
};
use nsq_conn_rs::error::Result;
use nsq_conn_rs::{Command, ConnectionConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // 配置日志
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .init();

    let nsqd_addr = "127.0.0.1:4150";

    // 生产者连接
    let producer = create_nsqd_connection(nsqd_addr, ConnectionConfig::default()).await?;
    publish_message(&producer, "test_topic", "hello nsq").await?;
    mpublish_messages(
        &producer,
        "test_topic",
        (0..3).map(|i| format!("批量消息 {}", i)).collect(),
    )
    .await?;
    delayed_publish_message(
        &producer,
        "test_topic",
        "延迟消息",
        Duration::from_secs(2),
    )
    .await?;
    producer.close().await?;

    // 消费者连接
    let consumer = create_nsqd_connection(nsqd_addr, ConnectionConfig::default()).await?;
    subscribe(&consumer, "test_topic", "test_channel", 10).await?;

    let mut received = 0;
    while received < 5 {
        let message = match tokio::time::timeout(Duration::from_secs(10), consumer.next_message())
            .await
        {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!("连接已关闭");
                break;
            }
            Err(_) => {
                warn!("等待消息超时");
                break;
            }
        };

        info!(
            "收到消息 - ID: {}, 尝试次数: {}, 内容: {:?}",
            message.id,
            message.attempts,
            String::from_utf8_lossy(&message.body)
        );

        if message.attempts > 3 {
            warn!("消息重试次数过多，直接完成");
        }
        message.fin().await?;
        received += 1;

        // 额度用完后补充
        if consumer.remaining_credit() == 0 {
            consumer.execute(Command::Ready(10)).await?;
        }
    }

    consumer.execute(Command::Cls).await?;
    consumer.close().await?;
    info!("共处理 {} 条消息", received);
    Ok(())
}

use std::env;

use log::{info, LevelFilter};
use nsq_conn_rs::commands::publish_message;
use nsq_conn_rs::error::Result;
use nsq_conn_rs::{Connection, ConnectionConfig, TlsConfig};

/// 用法: negotiate [snappy|deflate] [tls]
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Debug)
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut config = ConnectionConfig::default();

    if args.iter().any(|a| a == "snappy") {
        config.identify.snappy = Some(true);
    } else if args.iter().any(|a| a == "deflate") {
        config.identify.deflate = Some(true);
        config.identify.deflate_level = Some(6);
    }

    if args.iter().any(|a| a == "tls") {
        config.identify.tls_v1 = Some(true);
        config.tls = TlsConfig {
            ca_cert_path: env::var("NSQ_CA_CERT").ok(),
            insecure_skip_verify: env::var("NSQ_CA_CERT").is_err(),
            ..Default::default()
        };
    }

    config.auth_secret = env::var("NSQ_AUTH_SECRET").ok();

    let conn = Connection::connect("127.0.0.1:4150", config).await?;
    let response = conn.identify().await?;
    info!("IDENTIFY 协商结果: {:?}", response);
    info!("读取器: {:?}, 状态: {:?}", conn.reader_kind(), conn.state());

    if response.auth_required {
        let secret = env::var("NSQ_AUTH_SECRET").unwrap_or_default();
        let auth = conn.auth(secret).await?;
        info!("认证身份: {}", auth.identity);
    }

    publish_message(&conn, "test_topic", "negotiated").await?;
    conn.close().await?;
    Ok(())
}

//! TLS升级
//!
//! nsqd 在 IDENTIFY 响应中确认 `tls_v1` 后，客户端在原始TCP连接上发起TLS握手。

use std::sync::Arc;

use bytes::Bytes;
use log::warn;
use rustls::{
    pki_types::{CertificateDer, ServerName},
    ClientConfig, RootCertStore,
};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{Error, Result};
use crate::transport::{Rewind, Transport};

/// TLS配置
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// SNI 使用的服务器名，默认取连接地址的主机部分
    pub server_name: Option<String>,
    /// 自定义CA证书路径(PEM)
    pub ca_cert_path: Option<String>,
    /// 跳过证书校验(仅用于开发环境)
    pub insecure_skip_verify: bool,
}

/// 构造客户端TLS配置
pub fn create_client_config(config: &TlsConfig) -> Result<ClientConfig> {
    let builder =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Negotiation(format!("TLS协议版本配置失败: {}", e)))?;

    if config.insecure_skip_verify {
        warn!("TLS证书校验已关闭，切勿在生产环境使用");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth());
    }

    let root_store = match &config.ca_cert_path {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("读取CA证书 {} 失败: {}", path, e)))?;
            load_root_certs_from_pem(&pem)?
        }
        None => {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            root_store
        }
    };

    Ok(builder
        .with_root_certificates(root_store)
        .with_no_client_auth())
}

/// 在已有的TCP连接上完成TLS握手
///
/// `buffered` 是升级前已经读到但尚未消费的字节，会先交给TLS层。
pub async fn upgrade(
    stream: TcpStream,
    buffered: Bytes,
    host: &str,
    config: &TlsConfig,
) -> Result<Transport> {
    let client_config = create_client_config(config)?;
    let connector = TlsConnector::from(Arc::new(client_config));

    let name = config.server_name.as_deref().unwrap_or(host).to_string();
    let server_name = ServerName::try_from(name.clone())
        .map_err(|e| Error::Negotiation(format!("无效的TLS服务器名 {}: {}", name, e)))?;

    let tls_stream = connector
        .connect(server_name, Rewind::new(buffered, stream))
        .await
        .map_err(|e| Error::Negotiation(format!("TLS握手失败: {}", e)))?;

    Ok(Transport::Tls(Box::new(tls_stream)))
}

/// 从PEM加载根证书
fn load_root_certs_from_pem(pem: &str) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    let mut reader = std::io::BufReader::new(pem.as_bytes());

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok())
        .collect();

    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| Error::Config(format!("添加根证书失败: {}", e)))?;
    }

    if root_store.is_empty() {
        return Err(Error::Config("PEM中没有找到根证书".to_string()));
    }

    Ok(root_store)
}

/// 接受任何证书的校验器，只用于开发和测试
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

//! TLS 证书加载：同时提供证书与私钥时启用 HTTPS 监听。

use axum_server::tls_rustls::RustlsConfig;
use std::io;
use std::path::Path;
use tokio::fs;
use tracing::info;

/// 读取 PEM 证书与私钥；两者都缺省时返回 `None`，只给出其一视为配置错误。
pub async fn load_rustls_config(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> io::Result<Option<RustlsConfig>> {
    let (cert_path, key_path) = match (cert, key) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) => return Ok(None),
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tls_cert and tls_key must be provided together",
            ));
        }
    };

    let cert = fs::read(cert_path).await?;
    let key = fs::read(key_path).await?;
    let config = RustlsConfig::from_pem(cert, key).await?;
    info!(cert = ?cert_path, "loaded tls certificate");
    Ok(Some(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tls_is_optional_but_needs_both_halves() {
        assert!(load_rustls_config(None, None).await.expect("none").is_none());

        let half = load_rustls_config(Some(Path::new("cert.pem")), None).await;
        assert!(matches!(half, Err(err) if err.kind() == io::ErrorKind::InvalidInput));
    }
}

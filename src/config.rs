//! 命令行参数与服务默认配置。

use clap::Parser;
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DATA_DIR: &str = "data";
pub const STAGING_DIR: &str = "tmp";
pub const SESSION_FILE: &str = "session.json";
pub const ANONYMOUS_NICKNAME: &str = "anonymous";
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MAX_CHUNKS: u64 = 8192;
/// 单次上传分片数的硬上限，配置值不得超过它。
pub const MAX_CHUNKS_CEILING: u64 = 1 << 20;
pub const DEFAULT_STAGING_RETENTION_SECS: u64 = 60 * 60;
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60 * 60;
pub const DEFAULT_MERGE_WORKERS: usize = 4;
pub const DEFAULT_MERGE_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_MERGE_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MERGE_BACKOFF_MS: u64 = 500;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 30;
pub const QUEUE_FULL_RETRY_AFTER_SECS: u64 = 5;

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "site-storage", version = VERSION_INFO, about = "Personal site storage server")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "SITE_STORAGE_ROOT",
        default_value = "storage",
        help = "Storage root holding the data/ and tmp/ namespaces"
    )]
    pub storage_dir: String,
    #[arg(
        short = 'b',
        long,
        env = "SITE_STORAGE_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "SITE_STORAGE_HTTP_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "SITE_STORAGE_HTTPS_PORT",
        default_value_t = 8443,
        help = "HTTPS port (used only when a certificate is configured)"
    )]
    pub https_port: u16,
    #[arg(short = 'c', long, env = "SITE_STORAGE_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "SITE_STORAGE_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(
        long,
        env = "SITE_STORAGE_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "SITE_STORAGE_IDENTITY_SECRET",
        help = "Shared secret the auth gateway sends with forwarded identity headers"
    )]
    pub identity_secret: Option<String>,
    #[arg(
        long,
        env = "SITE_STORAGE_ALLOW_ANONYMOUS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Serve unauthenticated callers from the anonymous partition"
    )]
    pub allow_anonymous: bool,
    #[arg(
        long,
        env = "SITE_STORAGE_MAX_CHUNK_SIZE",
        default_value_t = DEFAULT_MAX_CHUNK_SIZE,
        help = "Max size of one upload chunk in bytes"
    )]
    pub max_chunk_size: u64,
    #[arg(
        long,
        env = "SITE_STORAGE_MAX_CHUNKS",
        default_value_t = DEFAULT_MAX_CHUNKS,
        value_parser = clap::value_parser!(u64).range(1..=MAX_CHUNKS_CEILING),
        help = "Max chunks per upload"
    )]
    pub max_chunks: u64,
    #[arg(
        long,
        env = "SITE_STORAGE_STAGING_RETENTION_SECS",
        default_value_t = DEFAULT_STAGING_RETENTION_SECS,
        help = "Inactivity in seconds after which staged uploads are reclaimed"
    )]
    pub staging_retention_secs: u64,
    #[arg(
        long,
        env = "SITE_STORAGE_GC_INTERVAL_SECS",
        default_value_t = DEFAULT_GC_INTERVAL_SECS,
        help = "Seconds between staging garbage collection sweeps"
    )]
    pub gc_interval_secs: u64,
    #[arg(
        long,
        env = "SITE_STORAGE_MERGE_WORKERS",
        default_value_t = DEFAULT_MERGE_WORKERS,
        help = "Number of background merge workers"
    )]
    pub merge_workers: usize,
    #[arg(
        long,
        env = "SITE_STORAGE_MERGE_QUEUE_CAPACITY",
        default_value_t = DEFAULT_MERGE_QUEUE_CAPACITY,
        help = "Max merge jobs waiting for a worker"
    )]
    pub merge_queue_capacity: usize,
    #[arg(
        long,
        env = "SITE_STORAGE_MERGE_MAX_ATTEMPTS",
        default_value_t = DEFAULT_MERGE_MAX_ATTEMPTS,
        help = "Attempts per merge before the session is marked failed"
    )]
    pub merge_max_attempts: u32,
    #[arg(
        long,
        env = "SITE_STORAGE_MERGE_BACKOFF_MS",
        default_value_t = DEFAULT_MERGE_BACKOFF_MS,
        help = "Initial merge retry backoff in milliseconds"
    )]
    pub merge_backoff_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_chunks_must_stay_within_ceiling() {
        let parsed = Args::try_parse_from(["site-storage"]).expect("defaults");
        assert_eq!(parsed.max_chunks, DEFAULT_MAX_CHUNKS);

        assert!(Args::try_parse_from(["site-storage", "--max-chunks", "0"]).is_err());
        let above = (MAX_CHUNKS_CEILING + 1).to_string();
        assert!(Args::try_parse_from(["site-storage", "--max-chunks", above.as_str()]).is_err());
    }
}

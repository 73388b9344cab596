use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;
// Drive rejects resumable chunks that are not a multiple of 256 KiB.
const UPLOAD_CHUNK_ALIGN: u64 = 256 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub log_level: String,
    pub download_path: PathBuf,
    pub aria2_rpc_url: String,
    pub aria2_secret: Option<String>,
    pub aria2_poll_ms: u64,
    pub aria2_binary: String,
    pub drive_token: Option<String>,
    pub drive_parent_id: Option<String>,
    pub index_link: Option<String>,
    pub upload_chunk_size: u64,
    pub decrypt_chunk_size: u64,
    pub progress_interval_secs: u64,
    pub tick_ms: u64,
    pub upload_attempts: u32,
    pub rpc_attempts: u32,
    pub seed_timeout_secs: Option<u64>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 3000)?
            .set_default("log_level", "info")?
            .set_default("download_path", "./downloads")?
            .set_default("aria2_rpc_url", "http://127.0.0.1:8100/jsonrpc")?
            .set_default("aria2_poll_ms", 500)?
            .set_default("aria2_binary", "aria2c")?
            .set_default("upload_chunk_size", 8 * MIB)?
            .set_default("decrypt_chunk_size", 50 * MIB)?
            .set_default("progress_interval_secs", 5)?
            .set_default("tick_ms", 100)?
            .set_default("upload_attempts", 5)?
            .set_default("rpc_attempts", 5)?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. RELAY_SERVER_PORT=8080)
            .add_source(Environment::with_prefix("RELAY"));

        builder.build()?.try_deserialize()
    }

    pub fn upload_chunk_size(&self) -> u64 {
        let aligned = self.upload_chunk_size / UPLOAD_CHUNK_ALIGN * UPLOAD_CHUNK_ALIGN;
        aligned.max(UPLOAD_CHUNK_ALIGN)
    }

    pub fn decrypt_chunk_size(&self) -> usize {
        self.decrypt_chunk_size.max(1) as usize
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.aria2_poll_ms.max(50))
    }

    pub fn seed_timeout(&self) -> Option<Duration> {
        self.seed_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
pub(crate) fn test_settings(download_path: PathBuf) -> Settings {
    Settings {
        server_port: 0,
        log_level: "info".to_string(),
        download_path,
        aria2_rpc_url: "http://127.0.0.1:8100/jsonrpc".to_string(),
        aria2_secret: None,
        aria2_poll_ms: 500,
        aria2_binary: "aria2c".to_string(),
        drive_token: None,
        drive_parent_id: None,
        index_link: None,
        upload_chunk_size: 8 * MIB,
        decrypt_chunk_size: 50 * MIB,
        progress_interval_secs: 5,
        tick_ms: 100,
        upload_attempts: 5,
        rpc_attempts: 5,
        seed_timeout_secs: None,
    }
}

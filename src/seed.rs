use std::net::TcpListener;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

use crate::record::DownloadRecord;

/// Post-completion seeding of finished torrents with a throwaway engine process.
#[derive(Debug, Clone)]
pub struct Seeder {
    binary: String,
    timeout: Option<Duration>,
}

impl Seeder {
    pub fn new(binary: String, timeout: Option<Duration>) -> Self {
        Self { binary, timeout }
    }

    pub fn torrent_path(record: &DownloadRecord) -> Option<PathBuf> {
        record
            .info_hash
            .as_ref()
            .map(|hash| record.dir.join(format!("{hash}.torrent")))
    }

    /// Seeds until the process exits (or the timeout elapses) and returns its stdout.
    /// `None` when there is no saved torrent to seed from or the process could not run.
    pub async fn seed(&self, record: &DownloadRecord) -> Option<String> {
        let torrent = Self::torrent_path(record)?;
        if !tokio::fs::metadata(&torrent).await.is_ok_and(|m| m.is_file()) {
            return None;
        }
        let port = match free_port() {
            Ok(port) => port,
            Err(e) => {
                warn!("No free port to seed [gid: '{}']: {e}", record.gid);
                return None;
            }
        };

        let child = Command::new(&self.binary)
            .arg("--enable-rpc")
            .arg("--rpc-listen-all=false")
            .arg(format!("--rpc-listen-port={port}"))
            .arg("--bt-seed-unverified=true")
            .arg("--seed-ratio=1")
            .arg(format!("--torrent-file={}", torrent.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start seeding [gid: '{}']: {e}", record.gid);
                return None;
            }
        };
        info!("Seeding: [gid: '{}'] on port {port}", record.gid);

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    // Dropping the future drops the child, which kills it.
                    info!("Seeding timed out: [gid: '{}']", record.gid);
                    return None;
                }
            },
            None => child.wait_with_output().await,
        };

        match output {
            Ok(output) => Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string()),
            Err(e) => {
                warn!("Seeding process failed [gid: '{}']: {e}", record.gid);
                None
            }
        }
    }
}

fn free_port() -> std::io::Result<u16> {
    Ok(TcpListener::bind(("127.0.0.1", 0))?.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::completed;

    fn torrent_record(dir: &std::path::Path) -> DownloadRecord {
        let mut record = completed("gid-t", "linux.iso", dir);
        record.is_bittorrent = true;
        record.info_hash = Some("abcdef".to_string());
        record
    }

    #[tokio::test]
    async fn skips_without_saved_torrent() {
        let tmp = tempfile::tempdir().unwrap();
        let seeder = Seeder::new("echo".to_string(), None);

        assert!(seeder.seed(&torrent_record(tmp.path())).await.is_none());
    }

    #[tokio::test]
    async fn captures_process_output() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("abcdef.torrent"), b"d4:infoe").unwrap();
        let seeder = Seeder::new("echo".to_string(), Some(Duration::from_secs(10)));

        let output = seeder.seed(&torrent_record(tmp.path())).await.unwrap();

        assert!(output.starts_with("--enable-rpc --rpc-listen-all=false --rpc-listen-port="));
        assert!(output.ends_with("abcdef.torrent"));
    }

    #[tokio::test]
    async fn missing_binary_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("abcdef.torrent"), b"d4:infoe").unwrap();
        let seeder = Seeder::new("definitely-not-an-engine-binary".to_string(), None);

        assert!(seeder.seed(&torrent_record(tmp.path())).await.is_none());
    }
}

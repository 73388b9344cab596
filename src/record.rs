use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const METADATA_PREFIX: &str = "[METADATA]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Active,
    Waiting,
    Paused,
    Complete,
    Error,
    Removed,
}

impl DownloadStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Waiting => "Waiting",
            Self::Paused => "Paused",
            Self::Complete => "Complete",
            Self::Error => "Error",
            Self::Removed => "Removed",
        }
    }
}

/// Where a finished download landed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    File,
    Directory,
    Missing,
}

/// Snapshot of one download as last reported by the engine.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub gid: String,
    pub name: String,
    pub status: DownloadStatus,
    pub is_metadata_only: bool,
    pub completed_length: u64,
    pub total_length: u64,
    pub download_speed: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub is_bittorrent: bool,
    pub info_hash: Option<String>,
    pub dir: PathBuf,
    pub file_count: usize,
    pub followed_by: Vec<String>,
}

impl DownloadRecord {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.name)
    }

    /// Fraction completed in `0.0..=1.0`.
    pub fn progress(&self) -> f64 {
        if self.total_length == 0 {
            0.0
        } else {
            self.completed_length as f64 / self.total_length as f64
        }
    }

    pub fn eta(&self) -> Option<Duration> {
        if self.download_speed == 0 {
            return None;
        }
        let remaining = self.total_length.saturating_sub(self.completed_length);
        Some(Duration::from_secs(remaining / self.download_speed))
    }

    pub fn is_complete(&self) -> bool {
        self.status == DownloadStatus::Complete
    }

    pub async fn location(&self) -> Location {
        locate(&self.path()).await
    }
}

pub async fn locate(path: &Path) -> Location {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Location::File,
        Ok(meta) if meta.is_dir() => Location::Directory,
        _ => Location::Missing,
    }
}

/// Raw `aria2.tellStatus` document. Numbers arrive as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDoc {
    pub gid: String,
    pub status: DownloadStatus,
    #[serde(default, deserialize_with = "numeric")]
    pub total_length: u64,
    #[serde(default, deserialize_with = "numeric")]
    pub completed_length: u64,
    #[serde(default, deserialize_with = "numeric")]
    pub download_speed: u64,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub dir: PathBuf,
    #[serde(default)]
    pub files: Vec<StatusFile>,
    pub bittorrent: Option<BittorrentDoc>,
    pub info_hash: Option<String>,
    #[serde(default)]
    pub followed_by: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusFile {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct BittorrentDoc {
    pub info: Option<BittorrentInfo>,
}

#[derive(Debug, Deserialize)]
pub struct BittorrentInfo {
    pub name: String,
}

fn numeric<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl From<StatusDoc> for DownloadRecord {
    fn from(doc: StatusDoc) -> Self {
        let torrent_name = doc
            .bittorrent
            .as_ref()
            .and_then(|bt| bt.info.as_ref())
            .map(|info| info.name.clone());
        let first_file = doc.files.first().map(|f| f.path.as_str()).unwrap_or("");
        let is_metadata_only = first_file.starts_with(METADATA_PREFIX);
        let name = match torrent_name {
            Some(name) => name,
            None if is_metadata_only => first_file.to_string(),
            None => Path::new(first_file)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| doc.gid.clone()),
        };

        Self {
            name,
            status: doc.status,
            is_metadata_only,
            completed_length: doc.completed_length,
            total_length: doc.total_length,
            download_speed: doc.download_speed,
            error_code: doc.error_code,
            error_message: doc.error_message,
            is_bittorrent: doc.bittorrent.is_some(),
            info_hash: doc.info_hash,
            dir: doc.dir,
            file_count: doc.files.len(),
            followed_by: doc.followed_by,
            gid: doc.gid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_http_status() {
        let doc: StatusDoc = serde_json::from_value(json!({
            "gid": "2089b05ecca3d829",
            "status": "active",
            "totalLength": "1048576",
            "completedLength": "262144",
            "downloadSpeed": "65536",
            "dir": "/downloads",
            "files": [{ "path": "/downloads/ubuntu.iso", "length": "1048576" }]
        }))
        .unwrap();
        let record = DownloadRecord::from(doc);

        assert_eq!(record.name, "ubuntu.iso");
        assert_eq!(record.status, DownloadStatus::Active);
        assert!(!record.is_metadata_only);
        assert!(!record.is_bittorrent);
        assert_eq!(record.path(), PathBuf::from("/downloads/ubuntu.iso"));
        assert_eq!(record.progress(), 0.25);
        assert_eq!(record.eta(), Some(Duration::from_secs(12)));
    }

    #[test]
    fn detects_magnet_metadata() {
        let doc: StatusDoc = serde_json::from_value(json!({
            "gid": "a1",
            "status": "complete",
            "totalLength": "0",
            "completedLength": "0",
            "downloadSpeed": "0",
            "dir": "/downloads",
            "files": [{ "path": "[METADATA]08ada5a7a6183aae1e09d831df6748d566095a10" }],
            "bittorrent": {},
            "infoHash": "08ada5a7a6183aae1e09d831df6748d566095a10",
            "followedBy": ["b2"]
        }))
        .unwrap();
        let record = DownloadRecord::from(doc);

        assert!(record.is_metadata_only);
        assert!(record.is_bittorrent);
        assert_eq!(record.followed_by, vec!["b2".to_string()]);
        assert_eq!(record.eta(), None);
    }

    #[test]
    fn torrent_name_wins_over_file_path() {
        let doc: StatusDoc = serde_json::from_value(json!({
            "gid": "c3",
            "status": "complete",
            "totalLength": "10",
            "completedLength": "10",
            "downloadSpeed": "0",
            "dir": "/downloads",
            "files": [
                { "path": "/downloads/Season 1/e01.mkv" },
                { "path": "/downloads/Season 1/e02.mkv" }
            ],
            "bittorrent": { "info": { "name": "Season 1" } }
        }))
        .unwrap();
        let record = DownloadRecord::from(doc);

        assert_eq!(record.name, "Season 1");
        assert_eq!(record.file_count, 2);
    }

    #[tokio::test]
    async fn locates_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bin"), b"x").unwrap();
        std::fs::create_dir(tmp.path().join("folder")).unwrap();

        assert_eq!(locate(&tmp.path().join("a.bin")).await, Location::File);
        assert_eq!(locate(&tmp.path().join("folder")).await, Location::Directory);
        assert_eq!(locate(&tmp.path().join("gone")).await, Location::Missing);
    }
}

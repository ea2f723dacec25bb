use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::util::path::sanitize_component;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Completed,
    Error,
}

impl TaskStatus {
    /// Whether a task in this status blocks a new submission of the same content.
    pub fn is_live(&self) -> bool {
        !matches!(self, TaskStatus::Error)
    }
}

/// Persisted record of one offline download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTask {
    pub id: String,
    /// Origin url. Replaced by the media playlist url once a master playlist is resolved.
    pub url: String,
    pub source: String,
    pub video_id: String,
    pub video_title: String,
    pub episode_index: u32,
    pub status: TaskStatus,
    /// 0 to 100
    pub progress: u8,
    /// Bytes for a direct file, segments for a m3u8 stream.
    pub total_size: u64,
    /// Same unit as `total_size`.
    pub downloaded_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<PathBuf>,
    pub file_name: String,
}

impl DownloadTask {
    pub fn new(
        url: String,
        source: String,
        video_id: String,
        video_title: String,
        episode_index: u32,
    ) -> Self {
        let file_name = output_file_name(&source, &video_id, episode_index);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url,
            source,
            video_id,
            video_title,
            episode_index,
            status: TaskStatus::Pending,
            progress: 0,
            total_size: 0,
            downloaded_size: 0,
            error: None,
            created_at: Utc::now(),
            file_path: None,
            file_name,
        }
    }

    pub fn is_same_content(&self, source: &str, video_id: &str, episode_index: u32) -> bool {
        self.source == source && self.video_id == video_id && self.episode_index == episode_index
    }

    /// Clear progress and error to start over from the beginning.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.progress = 0;
        self.total_size = 0;
        self.downloaded_size = 0;
        self.error = None;
    }

    /// Update counters and recompute progress. Progress never goes backwards.
    pub fn set_progress(&mut self, downloaded: u64, total: u64) {
        self.downloaded_size = downloaded;
        self.total_size = total;
        self.progress = self.progress.max(percentage(downloaded, total));
    }
}

/// Output file name of a content instance. Stable across runs and independent of the task store.
pub fn output_file_name(source: &str, video_id: &str, episode_index: u32) -> String {
    format!(
        "{}_{}_{episode_index}.mp4",
        sanitize_component(source),
        sanitize_component(video_id)
    )
}

/// Integer percentage clamped to 0..=100, 0 when the total is unknown.
pub fn percentage(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (downloaded.saturating_mul(100) / total).min(100) as u8
}

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::StreamExt;
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    error::{HozonError, HozonResult},
    fetch::{RetryPolicy, SegmentFetcher},
    hls::{resolve_playlist, MediaManifest},
    store::TaskStore,
    task::{output_file_name, DownloadTask, TaskStatus},
    util::{http::HttpClient, is_m3u8_url, path::remove_output},
};

/// Offline download engine.
///
/// ```text
///                  retry_task / restart
///            ┌──────────────────────────────┐
///            │                              │
/// add_task ──▼──► pending ──► downloading ──┼──► completed
///                                           │
///                                           └──► error
/// ```
///
/// Every task runs in its own tokio task. Segments of one task are fetched one
/// after another. All task mutations are written back to the [`TaskStore`].
#[derive(Clone)]
pub struct OfflineDownloader {
    inner: Arc<DownloaderInner>,
}

struct DownloaderInner {
    download_dir: PathBuf,
    store: TaskStore,
    fetcher: SegmentFetcher,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
}

impl OfflineDownloader {
    pub fn builder(download_dir: impl Into<PathBuf>) -> OfflineDownloaderBuilder {
        OfflineDownloaderBuilder::new(download_dir)
    }

    pub fn download_dir(&self) -> &Path {
        &self.inner.download_dir
    }

    /// Submit a download and return its task id.
    ///
    /// If the same content is already pending, downloading or completed, the id of
    /// that task is returned instead.
    pub fn add_task(
        &self,
        url: impl Into<String>,
        source: impl Into<String>,
        video_id: impl Into<String>,
        video_title: impl Into<String>,
        episode_index: u32,
    ) -> String {
        let source = source.into();
        let video_id = video_id.into();
        let existing = self.inner.store.find(|t| {
            t.status.is_live() && t.is_same_content(&source, &video_id, episode_index)
        });
        if let Some(existing) = existing {
            tracing::info!(
                "Task {} already exists for {source}/{video_id}#{episode_index}.",
                existing.id
            );
            return existing.id;
        }

        let task = DownloadTask::new(
            url.into(),
            source,
            video_id,
            video_title.into(),
            episode_index,
        );
        let id = task.id.clone();
        tracing::info!("Task {id} added: {} ({})", task.video_title, task.url);
        self.inner.store.create(task);
        self.spawn(id.clone());
        id
    }

    /// Start a finished or failed task again from the beginning.
    ///
    /// Fails with [`HozonError::DuplicateTask`] if another task of the same content
    /// is pending, downloading or completed.
    pub fn retry_task(&self, id: &str) -> HozonResult<()> {
        let mut task = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| HozonError::TaskNotFound(id.to_string()))?;

        let mut tokens = self.tokens();
        if task.status == TaskStatus::Downloading || tokens.contains_key(id) {
            return Err(HozonError::TaskRunning(id.to_string()));
        }
        if let Some(sibling) = self.live_sibling(&task) {
            return Err(HozonError::DuplicateTask(sibling.id));
        }

        tracing::info!("Retrying task {id}.");
        task.reset();
        self.inner.store.update(&task);

        let cancel = CancellationToken::new();
        tokens.insert(id.to_string(), cancel.clone());
        drop(tokens);
        self.start(id.to_string(), cancel);
        Ok(())
    }

    /// Cancel the in-flight download of a task. The task ends up in `error`.
    ///
    /// Returns whether a running download was cancelled.
    pub fn cancel_task(&self, id: &str) -> HozonResult<bool> {
        if self.inner.store.get(id).is_none() {
            return Err(HozonError::TaskNotFound(id.to_string()));
        }
        Ok(self.cancel(id))
    }

    /// Cancel and forget a task, then remove its output.
    pub async fn delete_task(&self, id: &str) -> HozonResult<()> {
        self.cancel(id);
        let task = self
            .inner
            .store
            .delete(id)
            .ok_or_else(|| HozonError::TaskNotFound(id.to_string()))?;
        tracing::info!("Task {id} deleted.");

        let output = self.inner.download_dir.join(&task.file_name);
        if let Some(sibling) = self.live_sibling(&task) {
            tracing::info!("Output {} kept for task {}.", output.display(), sibling.id);
            return Ok(());
        }
        remove_output(&output).await;
        if let Some(file_path) = task.file_path.filter(|p| *p != output) {
            remove_output(&file_path).await;
        }
        Ok(())
    }

    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.inner.store.list()
    }

    pub fn task(&self, id: &str) -> Option<DownloadTask> {
        self.inner.store.get(id)
    }

    /// Location of a downloaded content if its output exists, regardless of the task store.
    pub async fn offline_video(
        &self,
        source: &str,
        video_id: &str,
        episode_index: u32,
    ) -> Option<PathBuf> {
        let path = self
            .inner
            .download_dir
            .join(output_file_name(source, video_id, episode_index));
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    /// Wait until no download is in flight.
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Another task sharing the output of `task` that is pending, downloading or completed.
    fn live_sibling(&self, task: &DownloadTask) -> Option<DownloadTask> {
        self.inner.store.find(|t| {
            t.id != task.id
                && t.status.is_live()
                && t.is_same_content(&task.source, &task.video_id, task.episode_index)
        })
    }

    fn resume(&self) {
        for mut task in self.inner.store.list() {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Downloading) {
                continue;
            }

            tracing::info!("Resuming interrupted task {}.", task.id);
            task.reset();
            self.inner.store.update(&task);
            self.spawn(task.id);
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inner.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel(&self, id: &str) -> bool {
        match self.tokens().get(id) {
            Some(token) => {
                tracing::info!("Cancelling task {id}.");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn spawn(&self, id: String) {
        let cancel = CancellationToken::new();
        self.tokens().insert(id.clone(), cancel.clone());
        self.start(id, cancel);
    }

    fn start(&self, id: String, cancel: CancellationToken) {
        let this = self.clone();
        self.inner.tracker.spawn(async move {
            this.run(&id, &cancel).await;
            this.tokens().remove(&id);
        });
    }

    async fn run(&self, id: &str, cancel: &CancellationToken) {
        let Some(mut task) = self.inner.store.get(id) else {
            tracing::warn!("Task {id} disappeared before start.");
            return;
        };

        task.reset();
        task.status = TaskStatus::Downloading;
        task.file_path = None;
        self.inner.store.update(&task);

        let output = self.inner.download_dir.join(&task.file_name);
        let result = if is_m3u8_url(&task.url) {
            self.download_m3u8(&mut task, &output, cancel).await
        } else {
            self.download_file(&mut task, &output, cancel).await
        };
        let result = result.and_then(|_| {
            if cancel.is_cancelled() {
                Err(HozonError::Cancelled)
            } else {
                Ok(())
            }
        });

        match result {
            Ok(()) => {
                tracing::info!(
                    "Task {id} finished. Please checkout your file at {}",
                    output.display()
                );
                task.status = TaskStatus::Completed;
                task.progress = 100;
                task.file_path = Some(output);
            }
            Err(e) => {
                if e.is_cancelled() {
                    tracing::warn!("Task {id} cancelled.");
                } else {
                    tracing::error!("Task {id} failed: {e:?}");
                }
                match self.live_sibling(&task) {
                    Some(sibling) => tracing::warn!(
                        "Output {} belongs to task {}, not removed.",
                        output.display(),
                        sibling.id
                    ),
                    None => remove_output(&output).await,
                }
                task.status = TaskStatus::Error;
                task.error = Some(e.to_string());
            }
        }
        self.inner.store.update(&task);
    }

    async fn download_file(
        &self,
        task: &mut DownloadTask,
        output: &Path,
        cancel: &CancellationToken,
    ) -> HozonResult<()> {
        let url = Url::parse(&task.url)?;
        let response = self.inner.fetcher.open(&url, cancel).await?;
        let total = response.content_length().unwrap_or(0);
        task.set_progress(0, total);
        self.inner.store.update(task);

        let mut file = tokio::fs::File::create(output).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(HozonError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk?;
            file.write_all(&chunk).await?;

            downloaded += chunk.len() as u64;
            let progress = task.progress;
            task.set_progress(downloaded, total);
            if task.progress != progress {
                self.inner.store.update(task);
            }
        }
        file.flush().await?;

        task.set_progress(downloaded, total.max(downloaded));
        Ok(())
    }

    async fn download_m3u8(
        &self,
        task: &mut DownloadTask,
        output: &Path,
        cancel: &CancellationToken,
    ) -> HozonResult<()> {
        let fetcher = &self.inner.fetcher;
        let playlist = resolve_playlist(fetcher, Url::parse(&task.url)?, cancel).await?;
        if playlist.url.as_str() != task.url {
            task.url = playlist.url.to_string();
            self.inner.store.update(task);
        }

        let manifest = MediaManifest::parse(&playlist.text, &playlist.url)?;
        let key = manifest.load_key(fetcher, cancel).await?;
        let total = manifest.segments.len() as u64;
        tracing::info!(
            "{total} segment(s) found for task {}{}.",
            task.id,
            if key.is_some() { ", encrypted" } else { "" }
        );
        task.set_progress(0, total);
        self.inner.store.update(task);

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for (index, url) in manifest.segments.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(HozonError::Cancelled);
            }

            let data = fetcher.fetch_bytes(url, cancel).await?.to_vec();
            let data = match &key {
                Some(key) => key.decrypt(index, data),
                None => data,
            };
            segments.push(data);

            let downloaded = index as u64 + 1;
            task.set_progress(downloaded, total);
            self.inner.store.update(task);
            tracing::debug!(
                "Processing segment {index} finished. ({downloaded} / {total} or {}%)",
                task.progress
            );
        }

        if cancel.is_cancelled() {
            return Err(HozonError::Cancelled);
        }
        tracing::info!("Merging {total} segment(s)...");
        let mut file = tokio::fs::File::create(output).await?;
        for segment in &segments {
            file.write_all(segment).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

pub struct OfflineDownloaderBuilder {
    download_dir: PathBuf,
    store_file: PathBuf,
    retry: RetryPolicy,
    client: Option<HttpClient>,
    resume: bool,
}

impl OfflineDownloaderBuilder {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            store_file: PathBuf::from("tasks.json"),
            retry: RetryPolicy::default(),
            client: None,
            resume: true,
        }
    }

    /// Total attempts of every request.
    pub fn retries(mut self, attempts: u32) -> Self {
        self.retry.attempts = attempts;
        self
    }

    /// Delay before the first retry, doubled for every following one.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Whether interrupted tasks are restarted by [`build`](Self::build). Defaults to `true`.
    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Task store location. Relative paths are resolved in the download directory.
    pub fn store_file(mut self, store_file: impl Into<PathBuf>) -> Self {
        self.store_file = store_file.into();
        self
    }

    /// Open the task store and, unless disabled, resume every interrupted task.
    ///
    /// Must be called within a tokio runtime.
    pub async fn build(self) -> HozonResult<OfflineDownloader> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let store = TaskStore::open(self.download_dir.join(&self.store_file))?;
        let fetcher = SegmentFetcher::new(self.client.unwrap_or_default(), self.retry);

        let downloader = OfflineDownloader {
            inner: Arc::new(DownloaderInner {
                download_dir: self.download_dir,
                store,
                fetcher,
                tokens: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
        };
        if self.resume {
            downloader.resume();
        }
        Ok(downloader)
    }
}

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use crate::{error::HozonResult, task::DownloadTask};

/// Durable collection of download tasks backed by one JSON file.
///
/// Every mutation rewrites the whole file. Persistence failures are logged and
/// never returned, the in-memory state stays authoritative.
pub struct TaskStore {
    path: PathBuf,
    tasks: Mutex<Vec<DownloadTask>>,
}

impl TaskStore {
    /// Load the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> HozonResult<Self> {
        let path = path.into();
        let tasks = match std::fs::read(&path) {
            Ok(data) if data.iter().all(u8::is_ascii_whitespace) => Vec::new(),
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Loaded {} task(s) from {}", tasks.len(), path.display());

        Ok(Self {
            path,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn create(&self, task: DownloadTask) {
        let mut tasks = self.lock();
        tasks.push(task);
        self.persist(&tasks);
    }

    pub fn get(&self, id: &str) -> Option<DownloadTask> {
        self.lock().iter().find(|t| t.id == id).cloned()
    }

    pub fn list(&self) -> Vec<DownloadTask> {
        self.lock().clone()
    }

    /// First task matching `predicate`.
    pub fn find<P>(&self, predicate: P) -> Option<DownloadTask>
    where
        P: Fn(&DownloadTask) -> bool,
    {
        self.lock().iter().find(|t| predicate(t)).cloned()
    }

    /// Replace the stored record with the same id.
    ///
    /// Returns `false` without writing when the task no longer exists.
    pub fn update(&self, task: &DownloadTask) -> bool {
        let mut tasks = self.lock();
        let Some(stored) = tasks.iter_mut().find(|t| t.id == task.id) else {
            tracing::debug!("Task {} was removed, skip update.", task.id);
            return false;
        };
        *stored = task.clone();
        self.persist(&tasks);
        true
    }

    pub fn delete(&self, id: &str) -> Option<DownloadTask> {
        let mut tasks = self.lock();
        let index = tasks.iter().position(|t| t.id == id)?;
        let task = tasks.remove(index);
        self.persist(&tasks);
        Some(task)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<DownloadTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, tasks: &[DownloadTask]) {
        if let Err(e) = self.write(tasks) {
            tracing::error!("Failed to persist tasks to {}: {e}", self.path.display());
        }
    }

    /// Write to a sibling file first, then rename it over the store file.
    fn write(&self, tasks: &[DownloadTask]) -> HozonResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_vec_pretty(tasks)?;
        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        std::fs::write(&temp_path, data)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

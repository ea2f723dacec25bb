use std::{
    path::Path,
    time::{Duration, Instant},
};

use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
use hozon::{DownloadTask, HozonError, OfflineDownloader, TaskStatus};
use wiremock::MockServer;

use crate::{media_playlist, HttpMock};

const KEY: [u8; 16] = u128::to_be_bytes(0x000102030405060708090a0b0c0d0e0f);

async fn downloader(dir: &Path) -> anyhow::Result<OfflineDownloader> {
    let downloader = OfflineDownloader::builder(dir)
        .retries(3)
        .backoff(Duration::from_millis(10))
        .build()
        .await?;
    Ok(downloader)
}

fn encrypt(index: u32, plain: &[u8]) -> Vec<u8> {
    let iv = u128::from(index).to_be_bytes();
    cbc::Encryptor::<aes::Aes128>::new((&KEY).into(), (&iv).into())
        .encrypt_padded_vec_mut::<NoPadding>(plain)
}

/// Poll until `condition` holds for the task, panicking after a few seconds.
async fn wait_for<F>(downloader: &OfflineDownloader, id: &str, condition: F) -> DownloadTask
where
    F: Fn(&DownloadTask) -> bool,
{
    let start = Instant::now();
    loop {
        if let Some(task) = downloader.task(id) {
            if condition(&task) {
                return task;
            }
        }
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "condition not reached for task {id}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn mock_slow_stream(server: &MockServer, segments: usize) -> String {
    let uris: Vec<_> = (0..segments).map(|i| format!("{i}.ts")).collect();
    server
        .mock("/slow/media.m3u8", media_playlist(uris.as_slice()))
        .await;
    for uri in &uris {
        server
            .mock_delayed(
                &format!("/slow/{uri}"),
                [0x47u8; 188],
                Duration::from_millis(200),
            )
            .await;
    }
    format!("{}/slow/media.m3u8", server.uri())
}

#[tokio::test]
async fn download_direct_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    server.mock("/video.mp4", &body).await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(
        format!("{}/video.mp4", server.uri()),
        "tv",
        "42",
        "Some Title",
        1,
    );
    downloader.wait().await;

    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.downloaded_size, body.len() as u64);
    assert_eq!(task.total_size, body.len() as u64);
    assert_eq!(task.error, None);

    let path = dir.path().join("tv_42_1.mp4");
    assert_eq!(task.file_path.as_deref(), Some(path.as_path()));
    assert_eq!(std::fs::read(&path)?, body);
    assert_eq!(downloader.offline_video("tv", "42", 1).await, Some(path));
    assert_eq!(downloader.offline_video("tv", "42", 2).await, None);
    Ok(())
}

#[tokio::test]
async fn download_encrypted_stream_from_master() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;

    let plain0 = vec![0u8; 32];
    let plain1 = vec![1u8; 48];
    // not block aligned, treated as clear data
    let clear2 = vec![0x47u8; 188];

    server
        .mock(
            "/hls/master.m3u8",
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=800000\nvideo/media.m3u8\n",
        )
        .await
        .mock(
            "/hls/video/media.m3u8",
            format!(
                "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"
#EXTINF:10,
0.ts
#EXTINF:10,
/hls/video/1.ts
#EXTINF:10,
{}/hls/video/2.ts
#EXT-X-ENDLIST
",
                server.uri()
            ),
        )
        .await
        .mock("/hls/video/key.bin", KEY)
        .await
        .mock("/hls/video/0.ts", encrypt(0, &plain0))
        .await
        .mock("/hls/video/1.ts", encrypt(1, &plain1))
        .await
        .mock("/hls/video/2.ts", &clear2)
        .await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(
        format!("{}/hls/master.m3u8", server.uri()),
        "tv",
        "7",
        "Encrypted",
        0,
    );
    downloader.wait().await;

    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.error);
    assert_eq!(task.url, format!("{}/hls/video/media.m3u8", server.uri()));
    assert_eq!(task.total_size, 3);
    assert_eq!(task.downloaded_size, 3);
    assert_eq!(task.progress, 100);

    let output = std::fs::read(dir.path().join("tv_7_0.mp4"))?;
    assert_eq!(output, [plain0, plain1, clear2].concat());
    Ok(())
}

#[tokio::test]
async fn duplicate_submission_returns_existing_task() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock("/video.mp4", b"video").await;
    server.mock_status("/broken.mp4", 404, None).await;

    let downloader = downloader(dir.path()).await?;
    let url = format!("{}/video.mp4", server.uri());
    let first = downloader.add_task(&url, "tv", "1", "Title", 1);
    let pending = downloader.add_task(&url, "tv", "1", "Title", 1);
    assert_eq!(first, pending);

    downloader.wait().await;
    let completed = downloader.add_task(&url, "tv", "1", "Title", 1);
    assert_eq!(first, completed);
    assert_eq!(downloader.tasks().len(), 1);

    // a failed task does not block a new attempt
    let broken = format!("{}/broken.mp4", server.uri());
    let failed = downloader.add_task(&broken, "tv", "2", "Title", 1);
    downloader.wait().await;
    let task = downloader.task(&failed).expect("task exists");
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error.as_deref(), Some("HTTP error: 404 Not Found"));
    assert!(!dir.path().join("tv_2_1.mp4").exists());

    let again = downloader.add_task(&broken, "tv", "2", "Title", 1);
    assert_ne!(failed, again);
    downloader.wait().await;
    assert_eq!(downloader.tasks().len(), 3);
    Ok(())
}

#[tokio::test]
async fn empty_playlist_fails_task() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock("/empty.m3u8", "#EXTM3U\n#EXT-X-ENDLIST\n").await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(
        format!("{}/empty.m3u8", server.uri()),
        "tv",
        "1",
        "Title",
        1,
    );
    downloader.wait().await;

    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(
        task.error.as_deref(),
        Some("No playable segment found in playlist")
    );
    Ok(())
}

#[tokio::test]
async fn retry_restarts_from_first_segment() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server
        .mock("/media.m3u8", media_playlist(&["0.ts", "1.ts"]))
        .await
        .mock("/0.ts", [0u8; 188])
        .await
        // fails every attempt of the first run
        .mock_status("/1.ts", 500, Some(3))
        .await
        .mock("/1.ts", [1u8; 188])
        .await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(
        format!("{}/media.m3u8", server.uri()),
        "tv",
        "1",
        "Title",
        1,
    );
    downloader.wait().await;

    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.downloaded_size, 1);
    assert_eq!(task.progress, 50);

    downloader.retry_task(&id)?;
    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.progress, 0);
    assert_eq!(task.downloaded_size, 0);
    assert_eq!(task.error, None);

    downloader.wait().await;
    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(server.requests_to("/0.ts").await, 2);
    assert_eq!(server.requests_to("/1.ts").await, 4);

    let output = std::fs::read(dir.path().join("tv_1_1.mp4"))?;
    assert_eq!(output, [[0u8; 188], [1u8; 188]].concat());
    Ok(())
}

#[tokio::test]
async fn cancel_in_flight_download() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    let url = mock_slow_stream(&server, 20).await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(url, "tv", "1", "Title", 1);
    wait_for(&downloader, &id, |t| t.downloaded_size >= 1).await;

    assert!(matches!(
        downloader.retry_task(&id),
        Err(HozonError::TaskRunning(_))
    ));
    assert!(downloader.cancel_task(&id)?);
    downloader.wait().await;

    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error.as_deref(), Some("Download cancelled"));
    assert!(task.downloaded_size < 20);
    assert!(!dir.path().join("tv_1_1.mp4").exists());
    assert!(!downloader.cancel_task(&id)?);
    Ok(())
}

#[tokio::test]
async fn delete_cancels_and_removes_task() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    let url = mock_slow_stream(&server, 20).await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(url, "tv", "1", "Title", 1);
    wait_for(&downloader, &id, |t| t.downloaded_size >= 1).await;

    downloader.delete_task(&id).await?;
    downloader.wait().await;

    assert!(downloader.task(&id).is_none());
    assert!(downloader.tasks().is_empty());
    assert!(!dir.path().join("tv_1_1.mp4").exists());
    assert_eq!(server.requests_to("/slow/19.ts").await, 0);
    assert!(matches!(
        downloader.delete_task(&id).await,
        Err(HozonError::TaskNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn delete_removes_completed_output() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock("/video.mp4", b"video").await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(
        format!("{}/video.mp4", server.uri()),
        "tv",
        "1",
        "Title",
        1,
    );
    downloader.wait().await;
    assert!(downloader.offline_video("tv", "1", 1).await.is_some());

    downloader.delete_task(&id).await?;
    assert!(downloader.offline_video("tv", "1", 1).await.is_none());
    Ok(())
}

#[tokio::test]
async fn interrupted_tasks_resume_on_start() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock("/video.mp4", b"resumed").await;

    let mut interrupted = DownloadTask::new(
        format!("{}/video.mp4", server.uri()),
        "tv".to_string(),
        "1".to_string(),
        "Title".to_string(),
        1,
    );
    interrupted.status = TaskStatus::Downloading;
    interrupted.progress = 40;
    interrupted.total_size = 100;
    interrupted.downloaded_size = 40;

    let mut finished = DownloadTask::new(
        format!("{}/other.mp4", server.uri()),
        "tv".to_string(),
        "2".to_string(),
        "Title".to_string(),
        1,
    );
    finished.status = TaskStatus::Error;
    finished.error = Some("Download cancelled".to_string());

    std::fs::write(
        dir.path().join("tasks.json"),
        serde_json::to_vec(&[&interrupted, &finished])?,
    )?;

    let downloader = downloader(dir.path()).await?;
    downloader.wait().await;

    let task = downloader.task(&interrupted.id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.downloaded_size, 7);
    assert_eq!(std::fs::read(dir.path().join("tv_1_1.mp4"))?, b"resumed");

    let task = downloader.task(&finished.id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(server.requests_to("/other.mp4").await, 0);

    // the new state is durable
    drop(downloader);
    let reopened = hozon::store::TaskStore::open(dir.path().join("tasks.json"))?;
    let task = reopened.get(&interrupted.id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn stale_task_does_not_touch_sibling_output() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server
        .mock_status("/video.mp4", 500, Some(3))
        .await
        .mock("/video.mp4", b"video")
        .await;
    let url = format!("{}/video.mp4", server.uri());

    let downloader = downloader(dir.path()).await?;
    let failed = downloader.add_task(&url, "tv", "1", "Title", 1);
    downloader.wait().await;
    assert_eq!(
        downloader.task(&failed).map(|t| t.status),
        Some(TaskStatus::Error)
    );

    let completed = downloader.add_task(&url, "tv", "1", "Title", 1);
    assert_ne!(failed, completed);
    downloader.wait().await;
    assert_eq!(
        downloader.task(&completed).map(|t| t.status),
        Some(TaskStatus::Completed)
    );

    match downloader.retry_task(&failed) {
        Err(HozonError::DuplicateTask(id)) => assert_eq!(id, completed),
        other => panic!("unexpected retry result: {other:?}"),
    }
    assert_eq!(
        downloader.task(&failed).map(|t| t.status),
        Some(TaskStatus::Error)
    );

    downloader.delete_task(&failed).await?;
    assert!(downloader.task(&failed).is_none());
    assert_eq!(
        downloader.task(&completed).map(|t| t.status),
        Some(TaskStatus::Completed)
    );
    assert_eq!(
        downloader.offline_video("tv", "1", 1).await,
        Some(dir.path().join("tv_1_1.mp4"))
    );
    assert_eq!(std::fs::read(dir.path().join("tv_1_1.mp4"))?, b"video");
    assert_eq!(server.requests_to("/video.mp4").await, 4);
    Ok(())
}

#[tokio::test]
async fn retry_is_rejected_while_queued() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server
        .mock_status("/video.mp4", 500, Some(3))
        .await
        .mock("/video.mp4", b"video")
        .await;

    let downloader = downloader(dir.path()).await?;
    let id = downloader.add_task(
        format!("{}/video.mp4", server.uri()),
        "tv",
        "1",
        "Title",
        1,
    );
    downloader.wait().await;

    downloader.retry_task(&id)?;
    assert!(matches!(
        downloader.retry_task(&id),
        Err(HozonError::TaskRunning(_))
    ));
    downloader.wait().await;

    let task = downloader.task(&id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(server.requests_to("/video.mp4").await, 4);
    Ok(())
}

#[tokio::test]
async fn interrupted_tasks_stay_when_resume_disabled() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let server = MockServer::start().await;
    server.mock("/video.mp4", b"resumed").await;

    let mut interrupted = DownloadTask::new(
        format!("{}/video.mp4", server.uri()),
        "tv".to_string(),
        "1".to_string(),
        "Title".to_string(),
        1,
    );
    interrupted.status = TaskStatus::Downloading;
    std::fs::write(
        dir.path().join("tasks.json"),
        serde_json::to_vec(&[&interrupted])?,
    )?;

    let downloader = OfflineDownloader::builder(dir.path())
        .resume(false)
        .build()
        .await?;
    downloader.wait().await;

    let task = downloader.task(&interrupted.id).expect("task exists");
    assert_eq!(task.status, TaskStatus::Downloading);
    assert_eq!(server.requests_to("/video.mp4").await, 0);
    assert!(!dir.path().join("tv_1_1.mp4").exists());
    Ok(())
}

#[tokio::test]
async fn offline_video_does_not_need_task() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(dir.path().join("site_abc_3.mp4"), b"video")?;

    let downloader = downloader(dir.path()).await?;
    assert!(downloader.tasks().is_empty());
    assert_eq!(
        downloader.offline_video("site", "abc", 3).await,
        Some(dir.path().join("site_abc_3.mp4"))
    );
    Ok(())
}

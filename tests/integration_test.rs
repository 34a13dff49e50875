use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use relay::backends::{MemoryBackend, MemoryStateStore};
use relay::core::{
    PersistenceBridge,
    SessionStatus,
    HISTORY_EVENT_MEDIA_UPLOADED,
    SESSION_INTERRUPTED,
};
use relay::{
    QueueConfig,
    ThumbnailConfig,
    ThumbnailGenerator,
    UploadError,
    UploadEvent,
    UploadFile,
    UploadId,
    UploadItem,
    UploadManager,
    UploadManagerHandle,
    UploadStatus,
};

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    handle: UploadManagerHandle,
    manager: UploadManager,
    backend: MemoryBackend,
    state: Arc<MemoryStateStore>,
}

fn config(chunk_size: usize) -> QueueConfig {
    QueueConfig::new("user-1", "media").with_chunk_size(chunk_size)
}

fn start(config: QueueConfig, backend: MemoryBackend, state: Arc<MemoryStateStore>) -> Harness {
    let handle = UploadManager::builder(config)
        .storage(Arc::new(backend.clone()))
        .metadata(Arc::new(backend.clone()))
        .state_store(state.clone())
        .build()
        .unwrap();
    let manager = handle.manager.clone();

    Harness {
        handle,
        manager,
        backend,
        state,
    }
}

fn file(name: &str, size: usize) -> UploadFile {
    UploadFile::new(name, "video/mp4", vec![7u8; size])
}

async fn wait_for_status(manager: &UploadManager, upload_id: UploadId, status: UploadStatus) -> UploadItem {
    timeout(WAIT, async {
        loop {
            if let Some(item) = manager.get(upload_id).await.unwrap() {
                if item.status == status {
                    return item;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("upload {} never reached {}", upload_id, status))
}

async fn wait_for_progress(manager: &UploadManager, upload_id: UploadId, progress: u8) -> UploadItem {
    timeout(WAIT, async {
        loop {
            let item = manager.get(upload_id).await.unwrap().unwrap();
            if item.progress >= progress {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("progress never advanced")
}

/// Collect events until every id in `ids` completed or failed
async fn collect_until_done(rx: &mut broadcast::Receiver<UploadEvent>, ids: &[UploadId]) -> Vec<UploadEvent> {
    let mut pending: HashSet<UploadId> = ids.iter().copied().collect();
    let mut events = Vec::new();

    timeout(WAIT, async {
        while !pending.is_empty() {
            let event = rx.recv().await.unwrap();
            if let UploadEvent::Completed { upload_id, .. } | UploadEvent::Failed { upload_id, .. } = &event {
                pending.remove(upload_id);
            }
            events.push(event);
        }
    })
    .await
    .expect("uploads did not finish");

    events
}

#[tokio::test]
async fn test_twelve_megabytes_in_five_megabyte_chunks() {
    let h = start(config(5 * 1024 * 1024), MemoryBackend::new(), Arc::new(MemoryStateStore::new()));
    let mut rx = h.manager.subscribe();

    let upload_id = h.manager.enqueue(file("clip.mp4", 12 * 1024 * 1024), "draft-1").await.unwrap();
    let events = collect_until_done(&mut rx, &[upload_id]).await;

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::Progress { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![33, 67, 100]);

    let statuses: Vec<UploadStatus> = events
        .iter()
        .filter_map(|event| match event {
            UploadEvent::StateChanged { new_status, .. } => Some(*new_status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![UploadStatus::Uploading, UploadStatus::Processing, UploadStatus::Completed]
    );

    let item = h.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Completed);
    assert_eq!(item.progress, 100);
    assert_eq!(item.total_chunks, Some(3));
    assert!(item.error.is_none());
    assert!(item.completed_at.is_some());

    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].request.total_chunks, 3);
    assert_eq!(sessions[0].status, SessionStatus::Completed);
    assert_eq!(h.backend.chunk_count(&sessions[0].id), 3);

    let asset_path = item.asset_path.unwrap();
    assert!(asset_path.starts_with("user-1/draft-1/"));
    assert_eq!(h.backend.object("media", &asset_path).unwrap().len(), 12 * 1024 * 1024);
    assert_eq!(h.backend.assets().len(), 1);
    assert_eq!(h.backend.history()[0].event_type, HISTORY_EVENT_MEDIA_UPLOADED);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_priority_ordering() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));

    let blocker = h.manager.enqueue(file("blocker", 8), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;

    let low = h.manager.enqueue_with_priority(file("low", 8), "d", 1).await.unwrap();
    let high = h.manager.enqueue_with_priority(file("high", 8), "d", 9).await.unwrap();
    let mid = h.manager.enqueue_with_priority(file("mid", 8), "d", 5).await.unwrap();

    let order: Vec<String> = h.manager.items().await.unwrap().into_iter().map(|item| item.file_name).collect();
    assert_eq!(order, vec!["high", "mid", "low", "blocker"]);

    h.backend.open_gate();
    for upload_id in [blocker, low, high, mid] {
        wait_for_status(&h.manager, upload_id, UploadStatus::Completed).await;
    }

    let started: Vec<String> = h.backend.sessions().into_iter().map(|s| s.request.file_name).collect();
    assert_eq!(started, vec!["blocker", "high", "mid", "low"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reprioritize_changes_start_order() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));

    let blocker = h.manager.enqueue(file("blocker", 4), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;

    let first = h.manager.enqueue_with_priority(file("first", 4), "d", 5).await.unwrap();
    let second = h.manager.enqueue_with_priority(file("second", 4), "d", 1).await.unwrap();
    h.manager.reprioritize(second, 10).await.unwrap();
    assert!(matches!(
        h.manager.reprioritize(UploadId::new(), 1).await,
        Err(UploadError::NotFound(_))
    ));

    h.backend.open_gate();
    for upload_id in [blocker, first, second] {
        wait_for_status(&h.manager, upload_id, UploadStatus::Completed).await;
    }

    let started: Vec<String> = h.backend.sessions().into_iter().map(|s| s.request.file_name).collect();
    assert_eq!(started, vec!["blocker", "second", "first"]);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_progress_is_monotonic_and_uploads_are_exclusive() {
    let h = start(config(4), MemoryBackend::new(), Arc::new(MemoryStateStore::new()));
    let mut rx = h.manager.subscribe();

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(h.manager.enqueue(file(name, 16), "d").await.unwrap());
    }
    let events = collect_until_done(&mut rx, &ids).await;

    let mut last_progress: HashMap<UploadId, u8> = HashMap::new();
    let mut active: HashSet<UploadId> = HashSet::new();
    for event in &events {
        match event {
            UploadEvent::Progress { upload_id, progress } => {
                let last = last_progress.entry(*upload_id).or_insert(0);
                assert!(*progress >= *last, "progress went backwards");
                *last = *progress;
            }
            UploadEvent::StateChanged { upload_id, new_status, .. } => {
                if new_status.is_active() {
                    active.insert(*upload_id);
                } else {
                    active.remove(upload_id);
                }
                assert!(active.len() <= 1, "two uploads in flight");
            }
            _ => {}
        }
    }

    for upload_id in ids {
        assert_eq!(last_progress[&upload_id], 100);
    }

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_then_resume_continues_session() {
    let backend = MemoryBackend::new().with_put_delay(Duration::from_millis(20));
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));
    let mut rx = h.manager.subscribe();

    let upload_id = h.manager.enqueue(file("long.mp4", 40), "d").await.unwrap();
    wait_for_progress(&h.manager, upload_id, 20).await;

    h.manager.pause(upload_id).await.unwrap();
    let paused = h.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(paused.status, UploadStatus::Paused);

    // the in-flight chunk settles, then nothing moves
    tokio::time::sleep(Duration::from_millis(150)).await;
    let settled = h.manager.get(upload_id).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let later = h.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(later.status, UploadStatus::Paused);
    assert!(later.error.is_none());
    assert_eq!(later.progress, settled.progress);
    assert!(later.progress < 100);

    h.manager.resume(upload_id).await.unwrap();
    let events = collect_until_done(&mut rx, &[upload_id]).await;
    assert!(!events.iter().any(|event| matches!(event, UploadEvent::Failed { .. })));

    let item = h.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Completed);
    assert_eq!(item.progress, 100);

    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 1, "resume reuses the session");
    assert_eq!(sessions[0].status, SessionStatus::Completed);
    assert_eq!(h.backend.chunk_count(&sessions[0].id), 10);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_queued_item_and_invalid_actions() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));

    let active = h.manager.enqueue(file("active", 8), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;
    let waiting = h.manager.enqueue(file("waiting", 8), "d").await.unwrap();

    h.manager.pause(waiting).await.unwrap();
    assert!(matches!(
        h.manager.pause(waiting).await,
        Err(UploadError::InvalidState { status: UploadStatus::Paused, action: "pause", .. })
    ));
    assert!(matches!(
        h.manager.retry(waiting).await,
        Err(UploadError::InvalidState { status: UploadStatus::Paused, .. })
    ));
    assert!(matches!(
        h.manager.resume(active).await,
        Err(UploadError::InvalidState { status: UploadStatus::Uploading, .. })
    ));
    assert!(matches!(h.manager.pause(UploadId::new()).await, Err(UploadError::NotFound(_))));

    h.backend.open_gate();
    wait_for_status(&h.manager, active, UploadStatus::Completed).await;
    let still_paused = h.manager.get(waiting).await.unwrap().unwrap();
    assert_eq!(still_paused.status, UploadStatus::Paused);
    assert_eq!(still_paused.progress, 0);

    h.manager.resume(waiting).await.unwrap();
    wait_for_status(&h.manager, waiting, UploadStatus::Completed).await;

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_retry_after_chunk_failure_starts_over() {
    let backend = MemoryBackend::new();
    backend.fail_chunk(1, "network unreachable");
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));
    let mut rx = h.manager.subscribe();

    let upload_id = h.manager.enqueue(file("a.mp4", 12), "d").await.unwrap();
    let failed = wait_for_status(&h.manager, upload_id, UploadStatus::Failed).await;
    assert!(failed.error.as_deref().unwrap().contains("network unreachable"));
    assert_eq!(failed.progress, 33);
    assert_eq!(h.backend.sessions()[0].status, SessionStatus::Failed);

    h.manager.retry(upload_id).await.unwrap();
    let events = timeout(WAIT, async {
        let mut events = Vec::new();
        loop {
            let event = rx.recv().await.unwrap();
            let completed = matches!(event, UploadEvent::Completed { .. });
            events.push(event);
            if completed {
                return events;
            }
        }
    })
    .await
    .expect("retried upload did not complete");
    let after_retry: Vec<&UploadEvent> = events
        .iter()
        .skip_while(|event| !matches!(event, UploadEvent::Failed { .. }))
        .collect();
    assert!(after_retry.iter().any(|event| matches!(event, UploadEvent::Progress { progress: 0, .. })));

    let item = wait_for_status(&h.manager, upload_id, UploadStatus::Completed).await;
    assert!(item.error.is_none());
    assert_eq!(item.progress, 100);

    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 2, "retry opens a new session");
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert_eq!(sessions[1].status, SessionStatus::Completed);
    assert_eq!(item.session_id.as_deref(), Some(sessions[1].id.as_str()));

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_on_failed_item_is_rejected() {
    let backend = MemoryBackend::new();
    backend.fail_chunk(1, "network unreachable");
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));

    let upload_id = h.manager.enqueue(file("a.mp4", 12), "d").await.unwrap();
    wait_for_status(&h.manager, upload_id, UploadStatus::Failed).await;

    assert!(matches!(
        h.manager.resume(upload_id).await,
        Err(UploadError::InvalidState { status: UploadStatus::Failed, action: "resume", .. })
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let item = h.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Failed);
    assert_eq!(item.progress, 33);
    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Failed);
    assert!(h.backend.assets().is_empty());

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_during_last_chunk_still_finalizes() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));
    let mut rx = h.manager.subscribe();

    let upload_id = h.manager.enqueue(file("short.mp4", 4), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;

    h.manager.pause(upload_id).await.unwrap();
    h.backend.open_gate();

    let events = collect_until_done(&mut rx, &[upload_id]).await;
    assert!(!events.iter().any(|event| matches!(event, UploadEvent::Failed { .. })));

    let item = h.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Completed);
    assert_eq!(item.progress, 100);
    assert!(item.asset_path.is_some());

    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Completed);
    assert_eq!(h.backend.assets().len(), 1);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_resume_before_paused_task_stops_keeps_one_upload_in_flight() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));
    let mut rx = h.manager.subscribe();

    let first = h.manager.enqueue(file("first", 8), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;
    let second = h.manager.enqueue(file("second", 8), "d").await.unwrap();

    // the first chunk is still held by the gate when the item is requeued
    h.manager.pause(first).await.unwrap();
    h.manager.resume(first).await.unwrap();
    assert_eq!(h.manager.get(first).await.unwrap().unwrap().status, UploadStatus::Queued);

    h.backend.open_gate();
    let events = collect_until_done(&mut rx, &[first, second]).await;

    let mut active: HashSet<UploadId> = HashSet::new();
    for event in &events {
        if let UploadEvent::StateChanged { upload_id, new_status, .. } = event {
            if new_status.is_active() {
                active.insert(*upload_id);
            } else {
                active.remove(upload_id);
            }
            assert!(active.len() <= 1, "two uploads in flight");
        }
    }

    for upload_id in [first, second] {
        let item = h.manager.get(upload_id).await.unwrap().unwrap();
        assert_eq!(item.status, UploadStatus::Completed);
    }

    let sessions = h.backend.sessions();
    assert_eq!(sessions.len(), 2, "one session per item");
    assert!(sessions.iter().all(|session| session.status == SessionStatus::Completed));
    assert_eq!(sessions[0].request.file_name, "first");
    assert_eq!(h.backend.chunk_count(&sessions[0].id), 2);

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_queued_and_active_items() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let h = start(config(4), backend, Arc::new(MemoryStateStore::new()));

    let active = h.manager.enqueue(file("active", 12), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;
    let waiting = h.manager.enqueue(file("waiting", 12), "d").await.unwrap();

    h.manager.remove(waiting).await.unwrap();
    h.manager.remove(active).await.unwrap();
    assert!(matches!(h.manager.remove(active).await, Err(UploadError::NotFound(_))));
    assert!(h.manager.items().await.unwrap().is_empty());

    h.backend.open_gate();
    timeout(WAIT, async {
        while h.backend.sessions()[0].status != SessionStatus::Failed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("removed upload kept running");

    assert_eq!(h.backend.sessions().len(), 1);
    assert!(h.backend.assets().is_empty());
    assert!(h.manager.items().await.unwrap().is_empty());

    h.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reload_reconciliation() {
    let file = file("old.mp4", 8);
    let mut done = UploadItem::new(&file, "d", 0);
    done.status = UploadStatus::Completed;
    done.progress = 100;
    let mut busy = UploadItem::new(&file, "d", 0);
    busy.status = UploadStatus::Uploading;
    busy.progress = 50;
    busy.session_id = Some("s-1".to_string());

    let state = Arc::new(MemoryStateStore::new());
    let snapshot = PersistenceBridge::encode(&[done.clone(), busy.clone()]).unwrap();
    state.insert("upload_queue", snapshot);

    let h = start(config(4), MemoryBackend::new(), state);
    let items = h.manager.items().await.unwrap();
    assert_eq!(items.len(), 2);

    let restored_done = items.iter().find(|item| item.id == done.id).unwrap();
    assert_eq!(restored_done, &done);

    let restored_busy = items.iter().find(|item| item.id == busy.id).unwrap();
    assert_eq!(restored_busy.status, UploadStatus::Failed);
    assert_eq!(restored_busy.error.as_deref(), Some(SESSION_INTERRUPTED));

    assert!(matches!(
        h.manager.retry(busy.id).await,
        Err(UploadError::PayloadUnavailable(_))
    ));
    assert!(h.backend.sessions().is_empty());

    assert_eq!(h.manager.clear_finished().await.unwrap(), 1);
    h.handle.shutdown().await.unwrap();

    let saved = h.state.get("upload_queue").unwrap();
    let value: serde_json::Value = serde_json::from_str(&saved).unwrap();
    assert_eq!(value["items"].as_array().unwrap().len(), 1);
    assert_eq!(value["items"][0]["status"], "failed");
}

#[tokio::test]
async fn test_state_saved_on_change_and_interrupted_on_restart() {
    let backend = MemoryBackend::new();
    backend.close_gate();
    let state = Arc::new(MemoryStateStore::new());
    let config = config(4).with_abort_in_flight(true).with_state_key("queue-test");
    let h = start(config.clone(), backend.clone(), state.clone());

    let upload_id = h.manager.enqueue(file("a.mp4", 12), "d").await.unwrap();
    h.backend.wait_for_blocked_put().await;

    let saved = state.get("queue-test").unwrap();
    assert!(saved.contains(&upload_id.to_string()));
    assert!(!saved.contains("\"data\""));

    h.handle.shutdown().await.unwrap();
    backend.open_gate();

    let restarted = start(config, backend, state);
    let item = restarted.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(item.status, UploadStatus::Failed);
    assert_eq!(item.error.as_deref(), Some(SESSION_INTERRUPTED));

    restarted.handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_image_thumbnail_attached_on_enqueue() {
    let backend = MemoryBackend::new();
    let handle = UploadManager::builder(config(1024))
        .storage(Arc::new(backend.clone()))
        .metadata(Arc::new(backend))
        .state_store(Arc::new(MemoryStateStore::new()))
        .thumbnails(ThumbnailGenerator::new(ThumbnailConfig::default()))
        .build()
        .unwrap();

    let image = UploadFile::new("pic.png", "image/png", vec![1u8, 2, 3]);
    let upload_id = handle.manager.enqueue(image, "d").await.unwrap();
    let item = handle.manager.get(upload_id).await.unwrap().unwrap();
    assert_eq!(item.thumbnail.as_deref(), Some("data:image/png;base64,AQID"));

    let pdf = UploadFile::new("menu.pdf", "application/pdf", vec![0u8; 3]);
    let upload_id = handle.manager.enqueue(pdf, "d").await.unwrap();
    assert!(handle.manager.get(upload_id).await.unwrap().unwrap().thumbnail.is_none());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_builder_requires_backends() {
    let result = UploadManager::builder(config(4))
        .storage(Arc::new(MemoryBackend::new()))
        .build();
    assert!(result.is_err());
}

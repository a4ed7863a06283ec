#![cfg(unix)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use desktop48_core::media::{
    EventBus, ExitOutcome, MediaError, MediaTask, ProcessSpawner, ProcessSupervisor, TaskFactory,
    TaskKind, TaskRequest, TaskStatus,
};
use desktop48_core::settings::{MemorySettingsStore, SettingKey};

use common::{eventually, CountingSpawner, RefusingSpawner, Sandbox};

fn factory(
    sandbox: &Sandbox,
    settings: MemorySettingsStore,
    spawner: Arc<dyn ProcessSpawner>,
) -> TaskFactory {
    let supervisor = ProcessSupervisor::new(Some(spawner), EventBus::default());
    TaskFactory::new(Arc::new(settings), supervisor, &sandbox.config())
}

fn count_ends(task: &MediaTask) -> Arc<AtomicUsize> {
    let ended = Arc::new(AtomicUsize::new(0));
    let counter = ended.clone();
    task.set_on_end(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    ended
}

#[tokio::test]
async fn unset_save_directory_never_spawns() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_DONE);
    let spawner = CountingSpawner::new();
    let settings = MemorySettingsStore::new()
        .with(SettingKey::FfmpegDirectory, sandbox.tools.display().to_string());
    let task = factory(&sandbox, settings, spawner.clone())
        .download(TaskRequest::new("http://example/replay.m3u8", "replay.mp4", "100"))
        .await
        .unwrap();

    let err = task.start(|| panic!("must not start")).unwrap_err();
    assert!(matches!(err, MediaError::SaveDirectoryUnset));
    assert_eq!(spawner.count(), 0);
    assert_eq!(task.status(), TaskStatus::Prepared);
}

#[tokio::test]
async fn missing_save_directory_never_spawns() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_DONE);
    let spawner = CountingSpawner::new();
    let missing = sandbox.root.path().join("gone");
    let settings = sandbox
        .settings()
        .with(SettingKey::DownloadDirectory, missing.display().to_string());
    let task = factory(&sandbox, settings, spawner.clone())
        .download(TaskRequest::new("http://example/replay.m3u8", "replay.mp4", "101"))
        .await
        .unwrap();

    match task.start(|| {}) {
        Err(MediaError::SaveDirectoryMissing { path }) => assert_eq!(path, missing),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(spawner.count(), 0);
}

#[tokio::test]
async fn missing_ffmpeg_is_a_configuration_error() {
    let sandbox = Sandbox::new();
    let spawner = CountingSpawner::new();
    let task = factory(&sandbox, sandbox.settings(), spawner.clone())
        .record(TaskRequest::new("rtmp://example/live", "live.flv", "102"))
        .await
        .unwrap();

    let err = task.start(|| {}).unwrap_err();
    assert!(matches!(err, MediaError::ExecutableNotFound { .. }));
    assert!(err.is_configuration());
    assert_eq!(spawner.count(), 0);
}

#[tokio::test]
async fn stop_right_after_start_finishes_immediately() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_LONG);
    let spawner = CountingSpawner::new();
    let task = factory(&sandbox, sandbox.settings(), spawner.clone())
        .record(TaskRequest::new("rtmp://example/live", "live.flv", "200"))
        .await
        .unwrap();
    let ended = count_ends(&task);

    let started = AtomicUsize::new(0);
    task.start(|| {
        started.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(task.status(), TaskStatus::Active);
    let process = task.process().expect("process handle");

    task.stop();
    assert_eq!(task.status(), TaskStatus::Finished);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(task.file_path(), Some(sandbox.videos.join("live.flv")));

    // The interrupt still lands and counts as a clean exit.
    let outcome = tokio::time::timeout(Duration::from_secs(10), process.wait())
        .await
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Completed);

    task.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(spawner.count(), 1);
}

#[tokio::test]
async fn natural_completion_finishes_with_progress() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_DONE);
    let task = factory(&sandbox, sandbox.settings(), CountingSpawner::new())
        .download(TaskRequest::new("http://example/replay.m3u8", "replay.mp4", "300"))
        .await
        .unwrap();
    let ended = count_ends(&task);

    task.start(|| {}).unwrap();
    assert!(eventually(|| task.status() == TaskStatus::Finished).await);
    assert_eq!(ended.load(Ordering::SeqCst), 1);

    let snapshot = task.snapshot();
    assert_eq!(snapshot.kind, TaskKind::Download);
    assert_eq!(snapshot.file_path, Some(sandbox.videos.join("replay.mp4")));
    assert_eq!(snapshot.progress, Some(Duration::from_secs(3)));
    assert!(snapshot.finished_at.is_some());
    assert!(snapshot.error.is_none());
    assert!(sandbox.videos.join("replay.mp4").exists());
}

#[tokio::test]
async fn failing_ffmpeg_moves_task_to_failed() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_FAIL);
    let task = factory(&sandbox, sandbox.settings(), CountingSpawner::new())
        .download(TaskRequest::new("http://example/replay.m3u8", "replay.mp4", "400"))
        .await
        .unwrap();
    let ended = count_ends(&task);

    task.start(|| {}).unwrap();
    assert!(eventually(|| task.status() == TaskStatus::Failed).await);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(
        task.snapshot().error.as_deref(),
        Some("ffmpeg exited with code 1")
    );

    // Terminal: stop is a no-op and the callback does not fire again.
    task.stop();
    assert_eq!(task.status(), TaskStatus::Failed);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn spawn_error_fails_the_task_once() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_DONE);
    let task = factory(&sandbox, sandbox.settings(), Arc::new(RefusingSpawner))
        .record(TaskRequest::new("rtmp://example/live", "live.flv", "500"))
        .await
        .unwrap();
    let ended = count_ends(&task);

    let err = task.start(|| {}).unwrap_err();
    assert!(matches!(err, MediaError::Spawn { .. }));
    assert_eq!(task.status(), TaskStatus::Failed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ended.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn start_is_refused_once_running() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_LONG);
    let spawner = CountingSpawner::new();
    let task = factory(&sandbox, sandbox.settings(), spawner.clone())
        .record(TaskRequest::new("rtmp://example/live", "live.flv", "600"))
        .await
        .unwrap();

    task.start(|| {}).unwrap();
    match task.start(|| {}) {
        Err(MediaError::InvalidState { status, .. }) => assert_eq!(status, TaskStatus::Active),
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(spawner.count(), 1);
    task.stop();
}

#[tokio::test]
async fn events_only_reach_the_matching_task() {
    let sandbox = Sandbox::new();
    let quick_tools = sandbox.root.path().join("quick");
    std::fs::create_dir_all(&quick_tools).unwrap();
    common::write_tool(
        &quick_tools,
        "ffmpeg",
        r#"
for last; do :; done
printf 'frame=1 time=00:10:00.00 bitrate=1\r' >&2
printf 'frame=2 time=00:20:00.00 bitrate=1\r' >&2
: > "$last"
exit 0
"#,
    );
    sandbox.ffmpeg(common::CAPTURE_LONG);

    // Both tasks share one supervisor, and so one event bus.
    let supervisor = ProcessSupervisor::new(None, EventBus::default());
    let config = sandbox.config();
    let slow = TaskFactory::new(Arc::new(sandbox.settings()), supervisor.clone(), &config)
        .record(TaskRequest::new("rtmp://example/a", "a.flv", "A"))
        .await
        .unwrap();
    let quick_settings = sandbox
        .settings()
        .with(SettingKey::FfmpegDirectory, quick_tools.display().to_string());
    let quick = TaskFactory::new(Arc::new(quick_settings), supervisor.clone(), &config)
        .download(TaskRequest::new("http://example/b", "b.mp4", "B"))
        .await
        .unwrap();
    let slow_ended = count_ends(&slow);

    slow.start(|| {}).unwrap();
    quick.start(|| {}).unwrap();
    let own_values = [
        None,
        Some(Duration::from_millis(1500)),
        Some(Duration::from_secs(3)),
    ];
    let mut seen_foreign = false;
    let quick_done = eventually(|| {
        seen_foreign |= !own_values.contains(&slow.progress());
        quick.status() == TaskStatus::Finished
    })
    .await;
    assert!(quick_done);
    assert_eq!(quick.progress(), Some(Duration::from_secs(1200)));

    assert!(
        eventually(|| {
            seen_foreign |= !own_values.contains(&slow.progress());
            slow.progress() == Some(Duration::from_secs(3))
        })
        .await
    );
    assert!(!seen_foreign, "slow task picked up another task's progress");
    assert_eq!(slow.status(), TaskStatus::Active);
    assert_eq!(slow_ended.load(Ordering::SeqCst), 0);
    assert_eq!(slow.file_path(), Some(sandbox.videos.join("a.flv")));

    slow.stop();
    assert_eq!(slow_ended.load(Ordering::SeqCst), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn late_exit_of_a_stopped_process_spares_the_next_task() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_SLOW_STOP);
    let tasks = factory(&sandbox, sandbox.settings(), CountingSpawner::new());
    let request = || TaskRequest::new("rtmp://example/live", "live.flv", "L");

    let first = tasks.record(request()).await.unwrap();
    first.start(|| {}).unwrap();
    let first_process = first.process().expect("first process");
    tokio::time::sleep(Duration::from_millis(300)).await;
    first.stop();
    assert_eq!(first.status(), TaskStatus::Finished);

    // Same live id while the first ffmpeg is still winding down.
    let second = tasks.record(request()).await.unwrap();
    let second_ended = count_ends(&second);
    second.start(|| {}).unwrap();
    let second_process = second.process().expect("second process");
    assert_ne!(first_process.id(), second_process.id());

    let outcome = tokio::time::timeout(Duration::from_secs(10), first_process.wait())
        .await
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Completed);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(second.status(), TaskStatus::Active);
    assert!(second_process.is_running());
    assert_eq!(second_ended.load(Ordering::SeqCst), 0);
    assert!(first.snapshot().error.is_none());

    second.stop();
    assert_eq!(second.status(), TaskStatus::Finished);
    assert_eq!(second_ended.load(Ordering::SeqCst), 1);
    let outcome = tokio::time::timeout(Duration::from_secs(10), second_process.wait())
        .await
        .unwrap();
    assert_eq!(outcome, ExitOutcome::Completed);
}

#[tokio::test]
async fn lagging_listener_still_sees_the_task_finish() {
    let sandbox = Sandbox::new();
    sandbox.ffmpeg(common::CAPTURE_CHATTY);
    // Room for a single event, so the progress flood overruns the listener.
    let supervisor = ProcessSupervisor::new(None, EventBus::new(1));
    let task = TaskFactory::new(Arc::new(sandbox.settings()), supervisor, &sandbox.config())
        .download(TaskRequest::new("http://example/replay.m3u8", "replay.mp4", "700"))
        .await
        .unwrap();
    let ended = count_ends(&task);

    task.start(|| {}).unwrap();
    assert!(eventually(|| task.status() == TaskStatus::Finished).await);
    assert_eq!(ended.load(Ordering::SeqCst), 1);
    assert_eq!(task.progress(), Some(Duration::from_secs(40)));
    assert!(task.snapshot().error.is_none());
}

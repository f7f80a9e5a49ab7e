#![cfg(target_os = "linux")]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use wharf_core::watch::{
    EVENT_CHANNEL_CAPACITY, EventSource, Mask, Op, WatchError, WatchEvent,
};

const WAIT: Duration = Duration::from_secs(5);

fn start(
    source: &Arc<EventSource>,
) -> (
    mpsc::Receiver<WatchEvent>,
    JoinHandle<Result<(), WatchError>>,
) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let source = Arc::clone(source);
    let task = tokio::spawn(async move { source.watch(tx).await });
    (rx, task)
}

async fn next_event(rx: &mut mpsc::Receiver<WatchEvent>) -> WatchEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a watch event")
        .expect("event channel closed")
}

async fn wait_for(rx: &mut mpsc::Receiver<WatchEvent>, path: &Path, op: Op) -> WatchEvent {
    loop {
        let event = next_event(rx).await;
        if event.path == path && event.op.contains(op) {
            return event;
        }
    }
}

#[tokio::test]
async fn write_to_registered_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("config.toml");
    fs::write(&target, "http_port = 80\n").unwrap();

    let source = Arc::new(EventSource::open().unwrap());
    source.add_watch(&target, Op::REPLACE).unwrap();
    let (mut rx, _task) = start(&source);

    fs::write(dir.path().join("unrelated.txt"), "noise").unwrap();
    fs::write(&target, "http_port = 8080\n").unwrap();

    let event = next_event(&mut rx).await;
    assert_eq!(event.path, target);
    assert!(event.op.contains(Op::CLOSE_WRITE));
}

#[tokio::test]
async fn atomic_replace_is_reported_as_create() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("cert.pem");
    fs::write(&target, "old").unwrap();

    let source = Arc::new(EventSource::open().unwrap());
    source.add_watch(&target, Op::REPLACE).unwrap();
    let (mut rx, _task) = start(&source);

    let staged = dir.path().join(".cert.pem.tmp");
    fs::write(&staged, "new").unwrap();
    fs::rename(&staged, &target).unwrap();

    let event = wait_for(&mut rx, &target, Op::CREATE).await;
    assert!(event.mask.contains(Mask::IN_MOVED_TO));
}

#[tokio::test]
async fn registration_is_unique_and_shares_directories() {
    let dir = TempDir::new().unwrap();
    let cert = dir.path().join("cert.pem");
    let key = dir.path().join("key.pem");

    let source = EventSource::open().unwrap();
    source.add_watch(&cert, Op::REPLACE).unwrap();
    source.add_watch(&key, Op::REPLACE | Op::CHMOD).unwrap();

    let err = source
        .add_watch(dir.path().join("./cert.pem"), Op::REPLACE)
        .unwrap_err();
    assert!(matches!(err, WatchError::AlreadyWatched(_)));
    assert_eq!(source.directory_count(), 1);
    assert_eq!(source.watched(), vec![cert, key]);
}

#[tokio::test]
async fn missing_parent_directory_fails_registration() {
    let dir = TempDir::new().unwrap();
    let source = EventSource::open().unwrap();

    let err = source
        .add_watch(dir.path().join("absent/config.toml"), Op::REPLACE)
        .unwrap_err();

    assert!(matches!(err, WatchError::AddWatch { .. }));
    assert!(source.watched().is_empty());
}

#[tokio::test]
async fn removing_the_directory_deregisters_targets() {
    let dir = TempDir::new().unwrap();
    let tls = dir.path().join("tls");
    fs::create_dir(&tls).unwrap();
    let cert = tls.join("cert.pem");
    fs::write(&cert, "CERT").unwrap();

    let source = Arc::new(EventSource::open().unwrap());
    source.add_watch(&cert, Op::REPLACE).unwrap();
    let (mut rx, _task) = start(&source);

    fs::remove_dir_all(&tls).unwrap();

    loop {
        let event = next_event(&mut rx).await;
        assert_eq!(event.path, cert);
        if event.mask.contains(Mask::IN_DELETE_SELF) {
            assert_eq!(event.op, Op::REMOVE);
            break;
        }
    }
    assert!(source.watched().is_empty());
    assert_eq!(source.directory_count(), 0);
}

#[tokio::test]
async fn close_stops_the_read_loop() {
    let dir = TempDir::new().unwrap();
    let source = Arc::new(EventSource::open().unwrap());
    source
        .add_watch(dir.path().join("config.toml"), Op::REPLACE)
        .unwrap();
    let (_rx, task) = start(&source);

    source.close();

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(WatchError::Closed)));
    assert!(source.watched().is_empty());
    assert!(matches!(
        source.add_watch(dir.path().join("config.toml"), Op::REPLACE),
        Err(WatchError::Closed)
    ));
}

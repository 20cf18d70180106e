mod common;

use common::{resource_url, test_pool, test_pool_configured, ScriptedFetcher, SITE};
use filepool::pool::file_id::file_id_from_url;
use filepool::pool::package::PackageFile;
use filepool::pool::queue::PauseReason;
use filepool::pool::transfer::TransferError;
use filepool::pool::{FileOptions, FilepoolEvent, ProcessOutcome, QueueState};
use filepool::store::links::ComponentLink;
use filepool::store::queue::QueueKey;
use filepool::FilepoolError;
use pretty_assertions::assert_eq;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn key_for(url: &str) -> QueueKey {
    QueueKey::new(SITE, file_id_from_url(url))
}

#[tokio::test]
async fn test_process_next_follows_priority() {
    let t = test_pool();
    let low = resource_url("low.pdf");
    let high = resource_url("high.pdf");
    let mid = resource_url("mid.pdf");
    for (url, priority) in [(&low, 0), (&high, 5), (&mid, 1)] {
        t.pool
            .add_to_queue_by_url(SITE, url, &FileOptions::new().with_priority(priority))
            .unwrap();
    }

    let mut order = Vec::new();
    loop {
        match t.pool.process_next().await.unwrap() {
            ProcessOutcome::Downloaded(key) => order.push(key),
            ProcessOutcome::Empty => break,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    assert_eq!(order, vec![key_for(&high), key_for(&mid), key_for(&low)]);
    assert_eq!(t.fetcher.requested(), vec![high, mid, low]);
}

#[tokio::test]
async fn test_priority_is_clamped() {
    let t = test_pool();
    let url = resource_url("a.pdf");
    t.pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new().with_priority(5000))
        .unwrap();
    let other = resource_url("b.pdf");
    t.pool
        .add_to_queue_by_url(SITE, &other, &FileOptions::new().with_priority(-3))
        .unwrap();

    let entries = t.pool.get_queue_entries().unwrap();
    assert_eq!(entries[0].priority, 999);
    assert_eq!(entries[1].priority, 0);
}

#[tokio::test]
async fn test_duplicate_requests_merge() {
    let t = test_pool();
    let url = resource_url("notes.pdf");

    let first = t
        .pool
        .add_to_queue_by_url(
            SITE,
            &url,
            &FileOptions::for_component("mod_resource", Some("1")).with_priority(1),
        )
        .unwrap();
    let second = t
        .pool
        .add_to_queue_by_url(
            SITE,
            &url,
            &FileOptions::for_component("mod_folder", Some("2")).with_priority(5),
        )
        .unwrap();

    let entries = t.pool.get_queue_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].priority, 5);
    assert_eq!(
        entries[0].links,
        vec![
            ComponentLink::new("mod_resource", Some("1")),
            ComponentLink::new("mod_folder", Some("2")),
        ]
    );

    t.pool.process_next().await.unwrap();

    assert_eq!(first.wait().await, Ok(()));
    assert_eq!(second.wait().await, Ok(()));
    assert_eq!(t.fetcher.calls(), 1);
    assert_eq!(
        t.pool
            .get_file_links(SITE, &file_id_from_url(&url))
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn test_permanent_failure_drops_and_rejects() {
    let t = test_pool();
    let url = resource_url("gone.pdf");
    t.fetcher.fail(&url, TransferError::NotFound { status: 404 });

    let handle = t
        .pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new())
        .unwrap();
    let outcome = t.pool.process_next().await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Dropped { .. }));
    assert_eq!(
        handle.wait().await,
        Err(FilepoolError::Transfer(TransferError::NotFound { status: 404 }))
    );
    assert!(t.pool.get_queue_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_connection_refused_is_dropped() {
    let t = test_pool();
    let url = resource_url("refused.pdf");
    t.fetcher.fail(
        &url,
        TransferError::Connection {
            status: None,
            message: "connection refused".into(),
        },
    );

    t.pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new())
        .unwrap();

    assert!(matches!(
        t.pool.process_next().await.unwrap(),
        ProcessOutcome::Dropped { .. }
    ));
}

#[tokio::test]
async fn test_transient_failure_retains_and_keeps_waiting() {
    let t = test_pool();
    let url = resource_url("flaky.pdf");
    t.fetcher.fail(&url, TransferError::Aborted("timed out".into()));

    let handle = t
        .pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new())
        .unwrap();
    let waiter = tokio::spawn(handle.wait());

    let outcome = t.pool.process_next().await.unwrap();
    assert!(matches!(
        outcome,
        ProcessOutcome::Retained {
            error: FilepoolError::Transfer(TransferError::Aborted(_)),
            ..
        }
    ));
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());
    assert_eq!(t.pool.get_queue_entries().unwrap().len(), 1);

    t.fetcher.clear_failure(&url);
    let outcome = t.pool.process_next().await.unwrap();

    assert_eq!(outcome, ProcessOutcome::Downloaded(key_for(&url)));
    assert_eq!(waiter.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_current_copy_is_not_fetched_again() {
    let t = test_pool();
    let url = resource_url("notes.pdf");
    t.pool
        .download_url(SITE, &url, &FileOptions::new().with_revision(2, 0), None)
        .await
        .unwrap();

    let handle = t
        .pool
        .add_to_queue_by_url(
            SITE,
            &url,
            &FileOptions::for_component("mod_resource", Some("3")).with_revision(2, 0),
        )
        .unwrap();
    let outcome = t.pool.process_next().await.unwrap();

    assert_eq!(outcome, ProcessOutcome::AlreadyCurrent(key_for(&url)));
    assert_eq!(handle.wait().await, Ok(()));
    assert_eq!(t.fetcher.calls(), 1);
    assert_eq!(
        t.pool
            .get_files_by_component(SITE, "mod_resource", Some("3"))
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_external_files_are_always_refetched() {
    let t = test_pool();
    let url = "https://cdn.test/shared/video.mp4";
    let options = FileOptions {
        is_external_file: true,
        repository_type: Some("dropbox".into()),
        ..FileOptions::new()
    };
    t.pool.download_url(SITE, url, &options, None).await.unwrap();

    t.pool.add_to_queue_by_url(SITE, url, &options).unwrap();
    let outcome = t.pool.process_next().await.unwrap();

    assert!(matches!(outcome, ProcessOutcome::Downloaded(_)));
    assert_eq!(t.fetcher.calls(), 2);
    let entry = t.pool.get_file_entry_by_url(SITE, url).unwrap().unwrap();
    assert!(entry.is_external_file);
    assert_eq!(entry.repository_type.as_deref(), Some("dropbox"));
}

#[tokio::test]
async fn test_process_next_pauses_without_resources() {
    let t = test_pool();
    let url = resource_url("notes.pdf");
    t.pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new())
        .unwrap();

    t.network.set_online(false);
    assert_eq!(
        t.pool.process_next().await.unwrap(),
        ProcessOutcome::Paused(PauseReason::Offline)
    );

    t.network.set_online(true);
    t.fs.set_available(false);
    assert_eq!(
        t.pool.process_next().await.unwrap(),
        ProcessOutcome::Paused(PauseReason::FilesystemUnavailable)
    );
    assert_eq!(t.fetcher.calls(), 0);
    assert_eq!(t.pool.get_queue_entries().unwrap().len(), 1);
}

#[tokio::test]
async fn test_wifi_only_queue_waits_for_wifi() {
    let t = test_pool_configured(ScriptedFetcher::new(), |config| {
        config.queue.wifi_only = true;
    });
    let handle = t
        .pool
        .add_to_queue_by_url(SITE, &resource_url("notes.pdf"), &FileOptions::new())
        .unwrap();

    assert_eq!(
        t.pool.process_next().await.unwrap(),
        ProcessOutcome::Paused(PauseReason::NotOnWifi)
    );
    assert_eq!(t.fetcher.calls(), 0);

    let worker = t.pool.start_queue().expect("worker");
    t.network.set_wifi(true);

    let result = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(t.fetcher.calls(), 1);
    worker.stop();
}

#[tokio::test]
async fn test_enqueue_requires_filesystem() {
    let t = test_pool();
    t.fs.set_available(false);

    let result = t
        .pool
        .add_to_queue_by_url(SITE, &resource_url("notes.pdf"), &FileOptions::new());

    assert!(matches!(result, Err(FilepoolError::FilesystemUnavailable)));
}

#[tokio::test]
async fn test_removing_queued_file_rejects_waiters() {
    let t = test_pool();
    let url = resource_url("notes.pdf");
    let handle = t
        .pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new())
        .unwrap();

    t.pool.remove_file_by_url(SITE, &url).await.unwrap();

    assert!(matches!(handle.wait().await, Err(FilepoolError::NotInPool(_))));
    assert!(t.pool.get_queue_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_add_files_to_queue() {
    let t = test_pool();
    let files = vec![
        PackageFile::new(resource_url("a.pdf")),
        PackageFile {
            revision: 4,
            ..PackageFile::new(resource_url("b.pdf"))
        },
    ];

    let handles = t
        .pool
        .add_files_to_queue(SITE, &files, Some("mod_folder"), Some("8"))
        .unwrap();

    assert_eq!(handles.len(), 2);
    let entries = t.pool.get_queue_entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries
        .iter()
        .all(|e| e.links == vec![ComponentLink::new("mod_folder", Some("8"))]));
    assert!(entries.iter().any(|e| e.revision == 4));
}

#[tokio::test]
async fn test_worker_drains_queue() {
    let t = test_pool();
    let worker = t.pool.start_queue().expect("worker");
    assert!(t.pool.start_queue().is_none());

    let first = t
        .pool
        .add_to_queue_by_url(SITE, &resource_url("a.pdf"), &FileOptions::new())
        .unwrap();
    let second = t
        .pool
        .add_to_queue_by_url(SITE, &resource_url("b.pdf"), &FileOptions::new())
        .unwrap();

    assert_eq!(tokio::time::timeout(WAIT, first.wait()).await.unwrap(), Ok(()));
    assert_eq!(tokio::time::timeout(WAIT, second.wait()).await.unwrap(), Ok(()));
    assert!(t.pool.get_queue_entries().unwrap().is_empty());

    worker.stop();
    assert_eq!(t.pool.queue_state(), QueueState::Paused);
    assert!(t.pool.start_queue().is_some());
}

#[tokio::test]
async fn test_worker_resumes_when_back_online() {
    let t = test_pool();
    let mut events = t.pool.subscribe();
    t.network.set_online(false);
    let worker = t.pool.start_queue().expect("worker");

    let handle = t
        .pool
        .add_to_queue_by_url(SITE, &resource_url("a.pdf"), &FileOptions::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(t.fetcher.calls(), 0);
    assert_eq!(t.pool.get_queue_entries().unwrap().len(), 1);

    t.network.set_online(true);

    assert_eq!(tokio::time::timeout(WAIT, handle.wait()).await.unwrap(), Ok(()));
    assert_eq!(t.fetcher.calls(), 1);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let FilepoolEvent::QueueStateChanged(state) = event {
            states.push(state);
        }
    }
    assert!(states.contains(&QueueState::Running));
    assert!(states.contains(&QueueState::Paused));

    worker.stop();
}

#[tokio::test]
async fn test_worker_keeps_retained_items_until_success() {
    let t = common::test_pool_with(ScriptedFetcher::new());
    let url = resource_url("flaky.pdf");
    t.fetcher.fail(&url, TransferError::Aborted("reset".into()));
    let worker = t.pool.start_queue().expect("worker");

    let handle = t
        .pool
        .add_to_queue_by_url(SITE, &url, &FileOptions::new())
        .unwrap();
    let waiter = tokio::spawn(handle.wait());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.fetcher.calls() >= 2);
    assert!(!waiter.is_finished());

    t.fetcher.clear_failure(&url);
    let result = tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap();

    assert_eq!(result, Ok(()));
    worker.stop();
}

//! End-to-end transfers through a localhost router relay.

use std::sync::Arc;
use std::time::Duration;

use demonsaw_core::{EntropySource, Group, MachineConfig, Status, TransferConfig, TransferJob, TransferManager};
use demonsaw_files::{Chunk, MAX_CHUNK_SIZE, Queued, shard_count};
use demonsaw_integration_tests::{
    machine_config, pattern, router_config, start_router, transfer_config, wait_for,
};

async fn send_and_receive(
    machine: MachineConfig,
    settings: TransferConfig,
    size: usize,
    group: Option<Arc<Group>>,
) -> (TransferJob, TransferJob, Vec<u8>, Vec<u8>) {
    send_and_receive_within(machine, settings, size, group, Duration::from_secs(30)).await
}

async fn send_and_receive_within(
    machine: MachineConfig,
    settings: TransferConfig,
    size: usize,
    group: Option<Arc<Group>>,
    limit: Duration,
) -> (TransferJob, TransferJob, Vec<u8>, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    let target = dir.path().join("received.bin");
    let contents = pattern(size);
    std::fs::write(&source, &contents).unwrap();

    let mut upload = TransferJob::upload("e2e-slot", &source).await.unwrap();
    let mut download = TransferJob::download("e2e-slot", &target, size as u64);
    if let Some(group) = group {
        upload = upload.with_group(Arc::clone(&group));
        download = download.with_group(group);
    }

    let manager = TransferManager::new(machine, settings);
    manager.push(upload.clone());
    manager.push(download.clone());
    tokio::time::timeout(limit, manager.run()).await.unwrap();
    assert_eq!(manager.queue().finished().len(), 2);
    assert!(manager.queue().pending().is_empty());
    assert!(manager.queue().active().is_empty());

    let received = std::fs::read(&target).unwrap_or_default();
    (upload, download, contents, received)
}

#[tokio::test]
async fn test_sharded_transfer() {
    let (router, recorder) = start_router(router_config()).await;
    let (upload, download, sent, received) =
        send_and_receive(machine_config(&router), transfer_config(), 300 * 1024, None).await;

    assert_eq!(download.status(), Status::Success);
    assert_eq!(upload.status(), Status::Success);
    assert_eq!(received.len(), sent.len());
    assert!(received == sent, "received bytes differ");

    let transfer = download.transfer();
    assert!(transfer.complete());
    assert_eq!(transfer.chunks().acked(), 5);
    assert_eq!(transfer.ratio(), 1.0);

    // The slot closes once every byte was delivered
    assert!(router.relay().is_empty());
    assert!(recorder.events().len() >= 2);
    router.shutdown().await;
}

#[tokio::test]
async fn test_single_shard_small_file() {
    let (router, _) = start_router(router_config()).await;
    let settings = TransferConfig {
        thread_size: 1024 * 1024,
        ..transfer_config()
    };
    let (_, download, sent, received) =
        send_and_receive(machine_config(&router), settings, 70 * 1024, None).await;

    assert_eq!(download.status(), Status::Success);
    assert!(received == sent);
    assert_eq!(download.transfer().chunks().acked(), 2);
    router.shutdown().await;
}

#[tokio::test]
async fn test_group_wrapped_transfer() {
    let (router, _) = start_router(router_config()).await;
    let sources = vec![EntropySource::new("correct horse"), EntropySource::new("battery staple")];
    let (group, statuses) = Group::build(&sources, Duration::from_secs(1)).await;
    assert_eq!(statuses, vec![Status::Success, Status::Success]);
    let group = Arc::new(group.unwrap());

    let (upload, download, sent, received) =
        send_and_receive(machine_config(&router), transfer_config(), 150 * 1024, Some(group)).await;

    assert_eq!(upload.status(), Status::Success);
    assert_eq!(download.status(), Status::Success);
    assert!(received == sent);
    router.shutdown().await;
}

#[tokio::test]
async fn test_empty_file() {
    let (router, _) = start_router(router_config()).await;
    let (upload, download, _, received) =
        send_and_receive(machine_config(&router), transfer_config(), 0, None).await;

    assert_eq!(upload.status(), Status::Success);
    assert_eq!(download.status(), Status::Success);
    assert!(received.is_empty());
    assert_eq!(Queued::file_size(&download), 0);
    router.shutdown().await;
}

#[tokio::test]
async fn test_download_without_uploader_gives_up() {
    let (router, _) = start_router(router_config()).await;
    let dir = tempfile::tempdir().unwrap();
    let settings = TransferConfig {
        stall_ms: 200,
        max_retries: 1,
        ..transfer_config()
    };

    let job = TransferJob::download("orphan", dir.path().join("never.bin"), 4096);
    let manager = TransferManager::new(machine_config(&router), settings);
    manager.push(job.clone());
    tokio::time::timeout(Duration::from_secs(15), manager.run())
        .await
        .unwrap();

    assert_eq!(job.status(), Status::Error);
    assert_eq!(job.transfer().retries(), 1);
    assert!(!job.transfer().complete());
    router.shutdown().await;
}

#[tokio::test]
async fn test_two_shards_128k_chunks() {
    let (router, _) = start_router(router_config()).await;
    let kib = 1024;
    let settings = TransferConfig {
        chunk_size: 128 * kib,
        download_threads: 2,
        upload_threads: 2,
        thread_size: 256 * kib,
        ..transfer_config()
    };
    assert_eq!(
        shard_count(settings.download_threads(), 300 * kib, settings.thread_size, demonsaw_core::VERSION),
        2
    );

    let (upload, download, sent, received) =
        send_and_receive(machine_config(&router), settings, 300 * 1024, None).await;

    assert_eq!(upload.status(), Status::Success);
    assert_eq!(download.status(), Status::Success);
    assert!(received == sent);

    let transfer = download.transfer();
    for offset in [0, 131_072, 262_144] {
        assert!(transfer.chunks().is_acked(offset), "offset {offset}");
    }
    assert_eq!(transfer.chunks().acked(), 3);
    assert_eq!(Chunk::at(262_144, 300 * kib, 128 * kib).size, 38_912);
    assert_eq!(transfer.size(), 307_200);
    assert_eq!(transfer.ratio(), 1.0);
    router.shutdown().await;
}

#[tokio::test]
async fn test_largest_chunk_size() {
    let (router, _) = start_router(router_config()).await;
    let settings = TransferConfig {
        chunk_size: MAX_CHUNK_SIZE,
        download_threads: 1,
        upload_threads: 1,
        thread_size: MAX_CHUNK_SIZE * 2,
        stall_ms: 120_000,
        ..transfer_config()
    };
    settings.validate().unwrap();

    let size = usize::try_from(MAX_CHUNK_SIZE).unwrap();
    let (upload, download, sent, received) = send_and_receive_within(
        machine_config(&router),
        settings,
        size,
        None,
        Duration::from_secs(180),
    )
    .await;

    assert_eq!(upload.status(), Status::Success);
    assert_eq!(download.status(), Status::Success);
    assert_eq!(upload.transfer().retries(), 0);
    assert_eq!(download.transfer().retries(), 0);
    assert_eq!(received.len(), size);
    assert!(received == sent);
    router.shutdown().await;
}

#[tokio::test]
async fn test_stalled_download_returns_to_pending() {
    let (router, _) = start_router(router_config()).await;
    let dir = tempfile::tempdir().unwrap();
    let settings = TransferConfig {
        stall_ms: 200,
        max_retries: 3,
        ..transfer_config()
    };

    let job = TransferJob::download("lonely", dir.path().join("never.bin"), 4096);
    let manager = Arc::new(TransferManager::new(machine_config(&router), settings));
    manager.push(job.clone());
    let runner = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.run().await })
    };

    let queue_watch = Arc::clone(&manager);
    let requeued = wait_for(Duration::from_secs(10), move || {
        queue_watch
            .queue()
            .pending()
            .iter()
            .any(|pending| pending.id() == "lonely" && pending.transfer().retries() > 0)
    })
    .await;
    assert!(requeued, "stalled job never went back to pending");

    tokio::time::timeout(Duration::from_secs(20), runner)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status(), Status::Error);
    assert_eq!(job.transfer().retries(), 3);
    assert!(manager.queue().pending().is_empty());
    assert_eq!(manager.queue().finished().len(), 1);
    router.shutdown().await;
}

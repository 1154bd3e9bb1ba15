mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use common::{queue_settings, FakeClient};
use tapedeck::store::Store;
use tapedeck::transfer::{EnqueueRequest, TransferOutcome, TransferQueue};
use tapedeck::{SqliteStore, TransferStatus};
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str) -> Result<std::path::PathBuf> {
    let path = dir.path().join(name);
    std::fs::write(&path, b"ID3-audio")?;
    Ok(path)
}

#[tokio::test]
async fn entries_survive_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("state").join("tapedeck.db");

    let ids = {
        let store = Arc::new(SqliteStore::open(&db)?);
        let queue = TransferQueue::new(
            store.clone(),
            FakeClient::refusing(0),
            queue_settings(Duration::from_secs(60)),
        );
        let mut ids = Vec::new();
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            ids.push(queue.enqueue(EnqueueRequest::new(write(&dir, name)?, "rec@nas:/in/"))?);
        }

        // one upload was in flight when the process died
        let mut interrupted = store.get_transfer(&ids[1])?.expect("record");
        interrupted.status = TransferStatus::InProgress;
        store.update_transfer(&interrupted)?;
        ids
    };

    let store = Arc::new(SqliteStore::open(&db)?);
    let client = FakeClient::refusing(0);
    let queue = TransferQueue::new(store.clone(), client.clone(), queue_settings(Duration::from_secs(60)));
    assert_eq!(queue.rehydrate()?, 3);

    let status = queue.status()?;
    assert_eq!(status.queued, 3);
    assert_eq!(status.in_progress, 0);
    let pending: Vec<_> = queue.list_pending(10)?.into_iter().map(|t| t.id).collect();
    for id in &ids {
        assert!(pending.contains(id));
    }

    let mut delivered = 0;
    while let Some((_, outcome)) = queue.process_next().await? {
        assert_eq!(outcome, TransferOutcome::Delivered);
        delivered += 1;
    }
    assert_eq!(delivered, 3);
    assert!(queue.list_pending(10)?.is_empty());
    assert_eq!(client.calls().len(), 3);
    Ok(())
}

#[tokio::test]
async fn backoff_exhausts_after_max_retries() -> Result<()> {
    let dir = TempDir::new()?;
    let base = Duration::from_millis(150);
    let store = Arc::new(SqliteStore::open_memory()?);
    let client = FakeClient::refusing(usize::MAX);
    let queue = Arc::new(TransferQueue::new(store.clone(), client.clone(), queue_settings(base)));

    let id = queue.enqueue(EnqueueRequest::new(write(&dir, "show.mp3")?, "rec@nas:/in/").max_retries(3))?;

    let started = Instant::now();
    let mut outcomes = Vec::new();
    while outcomes.len() < 3 {
        match queue.process_next().await? {
            Some((_, outcome)) => outcomes.push(outcome),
            None => tokio::time::sleep(Duration::from_millis(10)).await,
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    assert_eq!(
        outcomes,
        vec![
            TransferOutcome::Retrying { attempts: 1, delay: base },
            TransferOutcome::Retrying { attempts: 2, delay: base * 2 },
            TransferOutcome::Failed { attempts: 3 },
        ]
    );

    let calls = client.calls();
    assert_eq!(calls.len(), 3);
    // scheduled delay totals D + 2D
    let span = calls[2] - calls[0];
    assert!(span >= base * 3, "{:?}", span);
    assert!(span < base * 3 + Duration::from_secs(2), "{:?}", span);

    // no fourth attempt, and the record stays queryable
    tokio::time::sleep(base * 4).await;
    assert!(queue.process_next().await?.is_none());
    assert_eq!(client.calls().len(), 3);
    let record = queue.get(&id)?.expect("failed record retained");
    assert_eq!(record.status, TransferStatus::Failed);
    assert_eq!(queue.status()?.failed, 1);

    // operator retry gives it another round
    queue.retry(&id)?;
    assert!(matches!(queue.process_next().await?, Some((_, TransferOutcome::Retrying { attempts: 1, .. }))));
    Ok(())
}

#[tokio::test]
async fn enqueue_then_success_removes_entry() -> Result<()> {
    let dir = TempDir::new()?;
    let store = Arc::new(SqliteStore::open_memory()?);
    let queue = Arc::new(TransferQueue::new(
        store.clone(),
        FakeClient::refusing(1),
        queue_settings(Duration::from_millis(20)),
    ));
    let cancel = tokio_util::sync::CancellationToken::new();
    let workers = queue.spawn_workers(2, &cancel);

    let id = queue.enqueue(EnqueueRequest::new(write(&dir, "show.mp3")?, "rec@nas:/in/"))?;
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.get_transfer(&id)?.is_some() {
        assert!(Instant::now() < deadline, "transfer never delivered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(queue.status()?.workers_running, 2);

    cancel.cancel();
    futures::future::join_all(workers).await;
    assert_eq!(queue.status()?.workers_running, 0);
    Ok(())
}

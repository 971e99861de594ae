// 端到端场景：只使用公开 API

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::FutureExt;
use resumable_transfer::{
    open_resumable, with_resumable, ChunkStatus, LocalBackend, MemoryBackend, OpenOptions,
    StorageBackend, TransferConfig, TransferEngine, TransferError, WriteOptions,
};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

fn chunk_payload(index: usize, size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i * 31 + index * 7) % 251) as u8).collect()
}

fn memory_engine(dir: &TempDir) -> (Arc<MemoryBackend>, TransferEngine) {
    let backend = Arc::new(MemoryBackend::new());
    let config = TransferConfig::with_state_dir(dir.path().join("state"));
    let engine = TransferEngine::new(backend.clone(), config);
    (backend, engine)
}

#[tokio::test]
async fn crash_and_resume_with_new_engine() {
    const TOTAL: u64 = 5_000_000;
    const CHUNK: u64 = 1_000_000;

    let dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(dir.path().join("objects")));
    let config = TransferConfig::with_state_dir(dir.path().join("state"));

    let engine = TransferEngine::new(backend.clone(), config.clone());
    let file_id = engine
        .start_resumable_write("uploads/big.bin", TOTAL, WriteOptions::with_chunk_size(CHUNK))
        .await
        .unwrap();

    for index in 0..3 {
        let result = engine
            .write_chunk(&file_id, index, &chunk_payload(index, CHUNK as usize))
            .await
            .unwrap();
        assert!(result.success);
    }
    assert_eq!(
        engine.load_state(&file_id).unwrap().completion_percentage(),
        60.0
    );
    drop(engine);

    // 新进程：同一个状态目录
    let engine = TransferEngine::new(backend.clone(), config);
    let resumed = engine.resume_operation(&file_id).await.unwrap();
    assert!(resumed.success);
    assert_eq!(resumed.remaining_chunks, vec![3, 4]);
    assert_eq!(resumed.completion_percentage, 60.0);

    for index in resumed.remaining_chunks {
        let result = engine
            .write_chunk(&file_id, index, &chunk_payload(index, CHUNK as usize))
            .await
            .unwrap();
        assert!(result.success);
    }

    let finalized = engine.finalize_write(&file_id).await.unwrap();
    assert!(finalized.success);

    let mut hasher = Sha256::new();
    for index in 0..5 {
        hasher.update(chunk_payload(index, CHUNK as usize));
    }
    assert_eq!(finalized.hash, Some(hex::encode(hasher.finalize())));

    let stat = backend.stat("uploads/big.bin").await.unwrap();
    assert_eq!(stat.size, TOTAL);
}

#[tokio::test]
async fn resume_reports_exact_complement() {
    const CHUNKS: usize = 4;

    for mask in 0u32..(1 << CHUNKS) {
        let dir = TempDir::new().unwrap();
        let (backend, engine) = memory_engine(&dir);
        let file_id = engine
            .start_resumable_write("f", (CHUNKS * 8) as u64, WriteOptions::with_chunk_size(8))
            .await
            .unwrap();

        let completed: Vec<usize> = (0..CHUNKS).filter(|i| mask & (1 << i) != 0).collect();
        for &index in &completed {
            engine
                .write_chunk(&file_id, index, &chunk_payload(index, 8))
                .await
                .unwrap();
        }
        drop(engine);

        let config = TransferConfig::with_state_dir(dir.path().join("state"));
        let engine = TransferEngine::new(backend, config);
        let resumed = engine.resume_operation(&file_id).await.unwrap();

        let expected: Vec<usize> = (0..CHUNKS).filter(|i| !completed.contains(i)).collect();
        assert_eq!(resumed.remaining_chunks, expected, "mask={:b}", mask);
        let pct = 100.0 * completed.len() as f64 / CHUNKS as f64;
        assert!((resumed.completion_percentage - pct).abs() < 1e-9);
    }
}

#[tokio::test]
async fn empty_file_completes_without_chunks() {
    let dir = TempDir::new().unwrap();
    let (backend, engine) = memory_engine(&dir);

    let file_id = engine
        .start_resumable_write("empty.bin", 0, WriteOptions::with_chunk_size(65536))
        .await
        .unwrap();

    let state = engine.load_state(&file_id).unwrap();
    assert!(state.completed);
    assert!(state.chunks.is_empty());

    let finalized = engine.finalize_write(&file_id).await.unwrap();
    assert!(finalized.success);
    assert_eq!(backend.object("empty.bin"), Some(Vec::new()));
}

#[tokio::test]
async fn concurrent_duplicates_share_one_write() {
    let dir = TempDir::new().unwrap();
    let (backend, engine) = memory_engine(&dir);
    backend.set_latency(Duration::from_millis(50));

    let file_id = engine
        .start_resumable_write("f", 16, WriteOptions::with_chunk_size(8).parallel(4))
        .await
        .unwrap();

    let data = chunk_payload(1, 8);
    let results = join_all((0..8).map(|_| engine.write_chunk(&file_id, 1, &data))).await;
    for result in results {
        assert!(result.unwrap().success);
    }
    assert_eq!(backend.chunk_write_count("f", 8), 1);
}

#[tokio::test]
async fn parallel_batch_matches_sequential_writes() {
    const CHUNKS: usize = 6;
    let dir = TempDir::new().unwrap();
    let (backend, engine) = memory_engine(&dir);
    backend.set_latency(Duration::from_millis(5));

    let sequential = engine
        .start_resumable_write("seq", 60, WriteOptions::with_chunk_size(10))
        .await
        .unwrap();
    for index in 0..CHUNKS {
        engine
            .write_chunk(&sequential, index, &chunk_payload(index, 10))
            .await
            .unwrap();
    }

    let parallel = engine
        .start_resumable_write("par", 60, WriteOptions::with_chunk_size(10).parallel(3))
        .await
        .unwrap();
    // 倒序提交，完成顺序与索引无关
    let batch = (0..CHUNKS)
        .rev()
        .map(|index| (index, chunk_payload(index, 10)))
        .collect();
    let result = engine.write_multiple_chunks(&parallel, batch).await.unwrap();
    assert_eq!(result.completed_chunks, CHUNKS);
    assert_eq!(result.failed_chunks, 0);
    assert_eq!(result.completion_percentage, 100.0);

    let a = engine.load_state(&sequential).unwrap();
    let b = engine.load_state(&parallel).unwrap();
    assert_eq!(a.chunks, b.chunks);
    assert_eq!(a.completed, b.completed);
    assert!(b.chunks.iter().all(|c| c.status == ChunkStatus::Completed));
    assert_eq!(backend.object("seq"), backend.object("par"));
}

#[tokio::test]
async fn finalize_is_guarded_then_idempotent() {
    let dir = TempDir::new().unwrap();
    let (_backend, engine) = memory_engine(&dir);
    let file_id = engine
        .start_resumable_write("f", 20, WriteOptions::with_chunk_size(10))
        .await
        .unwrap();

    engine
        .write_chunk(&file_id, 1, &chunk_payload(1, 10))
        .await
        .unwrap();
    assert!(matches!(
        engine.finalize_write(&file_id).await,
        Err(TransferError::Incomplete { ref remaining }) if remaining == &vec![0]
    ));

    engine
        .write_chunk(&file_id, 0, &chunk_payload(0, 10))
        .await
        .unwrap();
    let first = engine.finalize_write(&file_id).await.unwrap();
    let again = engine.finalize_write(&file_id).await.unwrap();
    assert!(first.success);
    assert!(first.hash.as_deref().map(|h| !h.is_empty()).unwrap_or(false));
    assert_eq!(first, again);
}

#[tokio::test]
async fn stream_write_then_read_back_on_disk() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(dir.path().join("objects")));
    let engine = TransferEngine::new(
        backend.clone(),
        TransferConfig::with_state_dir(dir.path().join("state")),
    );

    let content: Vec<u8> = (0..100u8).collect();
    let body = content.clone();
    with_resumable(
        &engine,
        "docs/report.bin",
        "wb",
        OpenOptions::new().size_hint(100).chunk_size(32),
        move |stream| {
            async move {
                for piece in body.chunks(7) {
                    stream.write(piece).await?;
                }
                Ok::<(), TransferError>(())
            }
            .boxed()
        },
    )
    .await
    .unwrap();

    let mut reader = open_resumable(&engine, "docs/report.bin", "rb", OpenOptions::new().chunk_size(32))
        .await
        .unwrap();
    let mut read_back = reader.read(Some(50)).await.unwrap();
    read_back.extend(reader.read(None).await.unwrap());
    let finalized = reader.close().await.unwrap();

    assert_eq!(read_back, content);
    assert!(finalized.is_some());
    assert!(engine.list_resumable_operations().unwrap().is_empty());
}

//! 分片调度器
//!
//! 每个 file_id 一个调度器，负责两件事：
//! 1. 用 Semaphore 限制该文件同时进行的分片 I/O 数（max_parallel_chunks）
//! 2. 单飞去重：同一分片索引同一时刻最多一个物理 I/O，
//!    并发的重复请求挂到已有的在途操作上，拿到同一个结果
//!
//! 每个分片操作都在独立的 tokio 任务中执行，调用方被取消也不会中断已发出的 I/O，
//! 关闭时可以通过 `drain()` 等待所有在途操作结束

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// 在途操作的共享结果
type InFlight<T> = Shared<BoxFuture<'static, Option<T>>>;

/// 在途操作表：分片索引 -> (代次, 共享结果)
type InFlightMap<T> = Arc<Mutex<HashMap<usize, (u64, InFlight<T>)>>>;

/// 分片调度器
pub struct ChunkScheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 文件 ID（日志用）
    file_id: String,
    /// 并发控制
    semaphore: Arc<Semaphore>,
    /// 最大并发分片数
    max_parallel: usize,
    /// 在途操作
    in_flight: InFlightMap<T>,
    /// 代次计数器，避免旧任务误删新登记的在途操作
    generation: AtomicU64,
    /// 实际发起的物理操作次数
    launched: Arc<AtomicUsize>,
    /// 挂靠到已有操作上的请求次数
    joined: AtomicUsize,
}

impl<T> ChunkScheduler<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// 创建调度器，`max_parallel` 至少为 1
    pub fn new(file_id: impl Into<String>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            file_id: file_id.into(),
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            launched: Arc::new(AtomicUsize::new(0)),
            joined: AtomicUsize::new(0),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// 当前在途分片数
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// 该索引是否有在途操作
    pub fn is_in_flight(&self, index: usize) -> bool {
        self.in_flight.lock().contains_key(&index)
    }

    /// 已发起的物理操作次数
    pub fn launched_count(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// 挂靠到已有操作的次数
    pub fn joined_count(&self) -> usize {
        self.joined.load(Ordering::SeqCst)
    }

    /// 执行分片操作
    ///
    /// 若该索引已有在途操作，直接等待它的结果，`make` 不会被调用；
    /// 否则调用 `make` 构造操作并在获得并发许可后执行
    ///
    /// 返回 None 表示执行任务异常退出（panic）
    pub async fn run<F, Fut>(&self, index: usize, make: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut map = self.in_flight.lock();
            if let Some((_, existing)) = map.get(&index) {
                self.joined.fetch_add(1, Ordering::SeqCst);
                debug!(
                    "[调度器 {}] 分片 #{} 已在途，挂靠到现有操作",
                    self.file_id, index
                );
                existing.clone()
            } else {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst);
                let shared = self.launch(index, generation, make());
                map.insert(index, (generation, shared.clone()));
                shared
            }
        };

        shared.await
    }

    /// 启动一个新的物理操作
    fn launch<Fut>(&self, index: usize, generation: u64, operation: Fut) -> InFlight<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let in_flight = self.in_flight.clone();
        let launched = self.launched.clone();
        let file_id = self.file_id.clone();

        let handle = tokio::spawn(async move {
            // 信号量只在调度器销毁时关闭，此时直接执行
            let _permit = semaphore.acquire_owned().await.ok();
            launched.fetch_add(1, Ordering::SeqCst);

            let output = operation.await;

            // 只删除本代次登记的条目
            let mut map = in_flight.lock();
            if matches!(map.get(&index), Some((g, _)) if *g == generation) {
                map.remove(&index);
            }
            output
        });

        async move {
            match handle.await {
                Ok(output) => Some(output),
                Err(e) => {
                    warn!("[调度器 {}] 分片 #{} 执行任务异常: {}", file_id, index, e);
                    None
                }
            }
        }
        .boxed()
        .shared()
    }

    /// 等待所有在途操作完成
    ///
    /// 关闭或收尾前调用，不会中断任何已经发出的 I/O
    pub async fn drain(&self) {
        loop {
            let pending: Vec<InFlight<T>> = self
                .in_flight
                .lock()
                .values()
                .map(|(_, shared)| shared.clone())
                .collect();

            if pending.is_empty() {
                break;
            }

            debug!(
                "[调度器 {}] 等待 {} 个在途分片完成",
                self.file_id,
                pending.len()
            );
            join_all(pending).await;
            // 被 panic 的任务不会自行清理条目，这里兜底
            self.in_flight
                .lock()
                .retain(|_, (_, shared)| shared.peek().is_none());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_index_single_flight() {
        let scheduler = Arc::new(ChunkScheduler::<u64>::new("f", 4));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let scheduler = scheduler.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(0, move || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            42
                        }
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some(42));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.launched_count(), 1);
        assert_eq!(scheduler.joined_count(), 4);
        assert_eq!(scheduler.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_sequential_requests_run_again() {
        let scheduler = ChunkScheduler::<usize>::new("f", 1);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            scheduler
                .run(7, move || async move { calls.fetch_add(1, Ordering::SeqCst) })
                .await;
        }

        // 前一次已完成，后续请求各自发起新操作
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let scheduler = Arc::new(ChunkScheduler::<()>::new("f", 2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for index in 0..8 {
            let scheduler = scheduler.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .run(index, move || async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(scheduler.launched_count(), 8);
    }

    #[tokio::test]
    async fn test_drain_waits_for_abandoned_operation() {
        let scheduler = Arc::new(ChunkScheduler::<()>::new("f", 1));
        let done = Arc::new(AtomicUsize::new(0));

        // 调用方放弃等待，操作仍然继续
        let caller = {
            let scheduler = scheduler.clone();
            let done = done.clone();
            tokio::spawn(async move {
                scheduler
                    .run(0, move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        caller.abort();

        scheduler.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.in_flight_count(), 0);
    }
}

// 内存后端
//
// 进程内对象存储，记录每一次物理读写，支持注入延迟和失败
// 用于单机场景和引擎行为验证（单飞去重、失败隔离、超时）

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{normalize_path, BackendStat, StorageBackend};
use crate::error::BackendError;

/// 可注入故障的操作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Read,
    Write,
}

/// 一次物理写入记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub path: String,
    pub offset: u64,
    pub len: usize,
    pub create: bool,
}

type FaultKey = (BackendOp, String, u64);

#[derive(Debug, Default)]
struct MemoryInner {
    objects: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
    writes: Vec<WriteRecord>,
    reads: Vec<(String, u64, u64)>,
    /// 剩余失败次数 + 返回的错误
    failures: HashMap<FaultKey, (u32, BackendError)>,
    delays: HashMap<FaultKey, Duration>,
}

/// 内存后端
#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<MemoryInner>,
    /// 所有读写统一附加的延迟
    latency: Mutex<Option<Duration>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为每次读写附加固定延迟
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// 在指定路径/偏移上注入 `times` 次失败
    pub fn inject_failure(
        &self,
        op: BackendOp,
        path: &str,
        offset: u64,
        times: u32,
        error: BackendError,
    ) {
        let key = (op, normalize_path(path).unwrap_or_default(), offset);
        self.inner.lock().failures.insert(key, (times, error));
    }

    /// 在指定路径/偏移上注入延迟（每次调用都生效）
    pub fn inject_delay(&self, op: BackendOp, path: &str, offset: u64, delay: Duration) {
        let key = (op, normalize_path(path).unwrap_or_default(), offset);
        self.inner.lock().delays.insert(key, delay);
    }

    /// 清除所有注入的故障和延迟
    pub fn clear_faults(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.delays.clear();
        *self.latency.lock() = None;
    }

    /// 直接放入一个对象
    pub fn put_object(&self, path: &str, data: Vec<u8>) {
        if let Ok(key) = normalize_path(path) {
            self.inner.lock().objects.insert(key, data);
        }
    }

    /// 读取整个对象
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        let key = normalize_path(path).ok()?;
        self.inner.lock().objects.get(&key).cloned()
    }

    /// 所有写入记录
    pub fn write_log(&self) -> Vec<WriteRecord> {
        self.inner.lock().writes.clone()
    }

    /// 指定偏移上的分片写入次数（不含创建对象的那次写入）
    pub fn chunk_write_count(&self, path: &str, offset: u64) -> usize {
        let key = normalize_path(path).unwrap_or_default();
        self.inner
            .lock()
            .writes
            .iter()
            .filter(|w| w.path == key && w.offset == offset && !w.create)
            .count()
    }

    /// 指定偏移上的读取次数
    pub fn read_count(&self, path: &str, offset: u64) -> usize {
        let key = normalize_path(path).unwrap_or_default();
        self.inner
            .lock()
            .reads
            .iter()
            .filter(|(p, o, _)| *p == key && *o == offset)
            .count()
    }

    /// 记录调用、取出注入的故障，返回应当等待的延迟
    fn before_call(
        &self,
        op: BackendOp,
        key: &str,
        offset: u64,
    ) -> (Option<Duration>, Option<BackendError>) {
        let fault_key = (op, key.to_string(), offset);
        let mut inner = self.inner.lock();

        let delay = inner
            .delays
            .get(&fault_key)
            .copied()
            .or(*self.latency.lock());

        let failure = match inner.failures.get_mut(&fault_key) {
            Some((remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Some(error.clone())
            }
            _ => None,
        };

        (delay, failure)
    }
}

fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn mkdir(&self, path: &str, _parents: bool) -> Result<(), BackendError> {
        let key = normalize_path(path)?;
        self.inner.lock().dirs.insert(key);
        Ok(())
    }

    async fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        create: bool,
    ) -> Result<(), BackendError> {
        let key = normalize_path(path)?;

        self.inner.lock().writes.push(WriteRecord {
            path: key.clone(),
            offset,
            len: data.len(),
            create,
        });

        let (delay, failure) = self.before_call(BackendOp::Write, &key, offset);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let mut inner = self.inner.lock();
        let object = if create {
            let object = inner.objects.entry(key).or_default();
            object.clear();
            object
        } else {
            inner
                .objects
                .get_mut(&key)
                .ok_or_else(|| BackendError::NotFound(path.to_string()))?
        };

        let start = offset as usize;
        let end = start + data.len();
        if object.len() < end {
            object.resize(end, 0);
        }
        object[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, BackendError> {
        let key = normalize_path(path)?;

        self.inner.lock().reads.push((key.clone(), offset, length));

        let (delay, failure) = self.before_call(BackendOp::Read, &key, offset);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let inner = self.inner.lock();
        let object = inner
            .objects
            .get(&key)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;

        let start = (offset as usize).min(object.len());
        let end = (offset.saturating_add(length) as usize).min(object.len());
        Ok(object[start..end].to_vec())
    }

    async fn stat(&self, path: &str) -> Result<BackendStat, BackendError> {
        let key = normalize_path(path)?;
        let inner = self.inner.lock();
        let object = inner
            .objects
            .get(&key)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;

        Ok(BackendStat {
            size: object.len() as u64,
            content_hash: content_hash(object),
        })
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let src_key = normalize_path(src)?;
        let dst_key = normalize_path(dst)?;
        let mut inner = self.inner.lock();
        let data = inner
            .objects
            .get(&src_key)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(src.to_string()))?;
        inner.objects.insert(dst_key, data);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        let key = normalize_path(path)?;
        self.inner
            .lock()
            .objects
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound(path.to_string()))
    }
}

// 本地文件系统后端
//
// 以一个根目录承载所有逻辑路径，路径经过规范化，禁止穿越到根目录之外

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::{normalize_path, BackendStat, StorageBackend};
use crate::error::BackendError;

/// 计算哈希时的读缓冲大小
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// 本地文件系统后端
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// 创建后端，`root` 不存在时在首次写入时创建
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// 根目录
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 逻辑路径映射为本地路径
    pub fn resolve(&self, path: &str) -> Result<PathBuf, BackendError> {
        let normalized = normalize_path(path)?;
        Ok(self.root.join(normalized))
    }

    async fn ensure_parent(&self, local: &Path) -> Result<(), BackendError> {
        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

/// 把 io::Error 转成后端错误，NotFound 带上逻辑路径
fn map_io(path: &str, e: std::io::Error) -> BackendError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BackendError::NotFound(path.to_string())
    } else {
        BackendError::from(e)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn mkdir(&self, path: &str, parents: bool) -> Result<(), BackendError> {
        let local = self.resolve(path)?;
        let result = if parents {
            fs::create_dir_all(&local).await
        } else {
            match fs::create_dir(&local).await {
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                other => other,
            }
        };
        result.map_err(|e| map_io(path, e))
    }

    async fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        create: bool,
    ) -> Result<(), BackendError> {
        let local = self.resolve(path)?;

        let mut file = if create {
            self.ensure_parent(&local).await?;
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&local)
                .await
                .map_err(|e| map_io(path, e))?
        } else {
            OpenOptions::new()
                .write(true)
                .open(&local)
                .await
                .map_err(|e| map_io(path, e))?
        };

        if !data.is_empty() {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| map_io(path, e))?;
            file.write_all(data).await.map_err(|e| map_io(path, e))?;
        }
        file.flush().await.map_err(|e| map_io(path, e))?;

        debug!(
            "本地写入: {} bytes={}-{}, create={}",
            path,
            offset,
            offset + data.len() as u64,
            create
        );
        Ok(())
    }

    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, BackendError> {
        let local = self.resolve(path)?;
        let mut file = File::open(&local).await.map_err(|e| map_io(path, e))?;

        let size = file.metadata().await.map_err(|e| map_io(path, e))?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let length = length.min(size - offset);

        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| map_io(path, e))?;

        let mut buffer = vec![0u8; length as usize];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| map_io(path, e))?;

        Ok(buffer)
    }

    async fn stat(&self, path: &str) -> Result<BackendStat, BackendError> {
        let local = self.resolve(path)?;
        let mut file = File::open(&local).await.map_err(|e| map_io(path, e))?;
        let size = file.metadata().await.map_err(|e| map_io(path, e))?.len();

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buffer).await.map_err(|e| map_io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(BackendStat {
            size,
            content_hash: hex::encode(hasher.finalize()),
        })
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        self.ensure_parent(&to).await?;
        fs::copy(&from, &to).await.map_err(|e| map_io(src, e))?;
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BackendError> {
        let local = self.resolve(path)?;
        fs::remove_file(&local).await.map_err(|e| map_io(path, e))
    }
}

//! 存储后端抽象
//!
//! 引擎只通过 `StorageBackend` 访问数据，所有分片 I/O 都必须是幂等的：
//! 同一偏移重复写入相同数据，结果不变
//!
//! 路径使用 `/` 分隔的逻辑路径，由具体后端负责映射

pub mod local;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BackendError;

pub use local::LocalBackend;
pub use memory::{BackendOp, MemoryBackend, WriteRecord};

/// 后端对象信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStat {
    /// 对象大小
    pub size: u64,
    /// 内容哈希（十六进制 SHA-256）
    pub content_hash: String,
}

/// 存储后端
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// 创建目录
    async fn mkdir(&self, path: &str, parents: bool) -> Result<(), BackendError>;

    /// 按偏移写入
    ///
    /// `create == true` 时创建对象（已存在则截断为空）后再写入；
    /// 否则对象必须已存在。写入位置超出当前大小时中间补零
    async fn write(
        &self,
        path: &str,
        data: &[u8],
        offset: u64,
        create: bool,
    ) -> Result<(), BackendError>;

    /// 读取 `[offset, offset + length)`，超出对象末尾的部分被截掉
    async fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, BackendError>;

    /// 获取对象大小和内容哈希，不存在时返回 `NotFound`
    async fn stat(&self, path: &str) -> Result<BackendStat, BackendError>;

    /// 整体复制对象
    async fn copy(&self, src: &str, dst: &str) -> Result<(), BackendError>;

    /// 删除对象
    async fn remove(&self, path: &str) -> Result<(), BackendError>;
}

/// 逻辑路径规范化
///
/// 去掉首尾 `/` 和空段，拒绝 `..` 穿越
pub fn normalize_path(path: &str) -> Result<String, BackendError> {
    let mut parts = Vec::new();
    for part in path.split(['/', '\\']) {
        match part {
            "" | "." => continue,
            ".." => return Err(BackendError::InvalidPath(path.to_string())),
            p => parts.push(p),
        }
    }

    if parts.is_empty() {
        return Err(BackendError::InvalidPath(path.to_string()));
    }

    Ok(parts.join("/"))
}

/// 逻辑路径的父目录（根目录下的对象返回 None）
pub fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize_path(path).ok()?;
    normalized
        .rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
}

//! 错误类型定义
//!
//! 分两层：
//! - `BackendError`：存储后端 I/O 失败（含超时子类型），分片级失败会被记录到分片状态上
//! - `TransferError`：引擎对调用方暴露的错误分类
//!
//! 两者都实现 `Clone`，同一个在途分片操作的结果需要分发给所有等待者

use std::time::Duration;
use thiserror::Error;

/// 存储后端错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// 对象不存在
    #[error("对象不存在: {0}")]
    NotFound(String),

    /// 单次调用超时
    #[error("后端调用超时 ({}ms)", .0.as_millis())]
    Timeout(Duration),

    /// 非法路径（越界、空路径等）
    #[error("非法路径: {0}")]
    InvalidPath(String),

    /// 其他 I/O 失败
    #[error("后端 I/O 错误: {0}")]
    Io(String),
}

impl BackendError {
    /// 是否值得重试
    ///
    /// 对象不存在、路径非法属于确定性失败，重试没有意义
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }

    /// 是否为超时
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            _ => Self::Io(e.to_string()),
        }
    }
}

/// 传输引擎错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransferError {
    /// 参数校验失败（chunk_size / total_size / 索引 / 偏移 / 方向）
    #[error("参数错误: {0}")]
    Validation(String),

    /// file_id 或后端路径不存在
    #[error("未找到: {0}")]
    NotFound(String),

    /// 分片数据长度与分片大小不一致
    #[error("分片 #{index} 长度不匹配: 期望 {expected} bytes, 实际 {actual} bytes")]
    SizeMismatch {
        index: usize,
        expected: u64,
        actual: u64,
    },

    /// 还有分片未完成
    #[error("传输未完成，剩余分片: {remaining:?}")]
    Incomplete { remaining: Vec<usize> },

    /// 持久化状态无法解析
    #[error("状态文件损坏 (file_id={file_id}): {reason}")]
    CorruptState { file_id: String, reason: String },

    /// 后端 I/O 失败
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// 使用方式冲突（例如向已完成的操作继续写入）
    #[error("并发/状态冲突: {0}")]
    Concurrency(String),

    /// 状态持久化失败
    #[error("状态持久化失败 (file_id={file_id}): {reason}")]
    Persistence { file_id: String, reason: String },
}

impl TransferError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn persistence(file_id: &str, e: impl std::fmt::Display) -> Self {
        Self::Persistence {
            file_id: file_id.to_string(),
            reason: e.to_string(),
        }
    }

    /// 是否为超时错误
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Backend(e) if e.is_timeout())
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

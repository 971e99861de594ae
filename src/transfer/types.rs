// 传输引擎的调用参数与返回结果

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 写入操作参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOptions {
    /// 分片大小，None 时使用引擎默认值
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// 附带元数据
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// 是否根据吞吐量推荐分片大小
    #[serde(default)]
    pub adaptive_chunking: bool,
    /// 是否允许分片并发
    #[serde(default)]
    pub parallel_transfers: bool,
    /// 最大并发分片数（仅在 parallel_transfers 时生效）
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
}

/// 读取操作参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadOptions {
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub parallel_transfers: bool,
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
}

fn default_max_parallel_chunks() -> usize {
    1
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            metadata: BTreeMap::new(),
            adaptive_chunking: false,
            parallel_transfers: false,
            max_parallel_chunks: default_max_parallel_chunks(),
        }
    }
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            chunk_size: None,
            metadata: BTreeMap::new(),
            parallel_transfers: false,
            max_parallel_chunks: default_max_parallel_chunks(),
        }
    }
}

/// 实际生效的并发数
fn effective_parallelism(parallel_transfers: bool, max_parallel_chunks: usize) -> usize {
    if parallel_transfers {
        max_parallel_chunks.max(1)
    } else {
        1
    }
}

impl WriteOptions {
    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    pub fn adaptive(mut self) -> Self {
        self.adaptive_chunking = true;
        self
    }

    pub fn parallel(mut self, max_parallel_chunks: usize) -> Self {
        self.parallel_transfers = true;
        self.max_parallel_chunks = max_parallel_chunks;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn effective_parallelism(&self) -> usize {
        effective_parallelism(self.parallel_transfers, self.max_parallel_chunks)
    }
}

impl ReadOptions {
    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    pub fn parallel(mut self, max_parallel_chunks: usize) -> Self {
        self.parallel_transfers = true;
        self.max_parallel_chunks = max_parallel_chunks;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn effective_parallelism(&self) -> usize {
        effective_parallelism(self.parallel_transfers, self.max_parallel_chunks)
    }
}

/// 写入目标分片：按索引或按落在分片内的字节偏移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkTarget {
    Index(usize),
    Offset(u64),
}

impl From<usize> for ChunkTarget {
    fn from(index: usize) -> Self {
        ChunkTarget::Index(index)
    }
}

/// 单分片写入结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkWriteResult {
    pub chunk_index: usize,
    pub success: bool,
    pub chunk_start: u64,
    /// 结束偏移（不含）
    pub chunk_end: u64,
    pub completion_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 单分片读取结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReadResult {
    pub chunk_index: usize,
    pub success: bool,
    /// 失败时为空
    pub chunk_data: Vec<u8>,
    pub completion_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 批量分片结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiChunkResult<R> {
    /// 分片索引 -> 单分片结果
    pub results: BTreeMap<usize, R>,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    /// 批量调用结束时的整体进度
    pub completion_percentage: f64,
}

/// 恢复结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeResult {
    pub file_id: String,
    pub success: bool,
    pub completion_percentage: f64,
    pub remaining_chunks: Vec<usize>,
}

/// 收尾结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeResult {
    pub success: bool,
    /// 写入操作的内容哈希，读取操作为 None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// 复制结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyResult {
    pub success: bool,
    /// 新操作的 file_id
    pub file_id: String,
    pub completion_percentage: f64,
}

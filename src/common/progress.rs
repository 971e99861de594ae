//! 进度上报
//!
//! 把分片完成样本换算成速度、剩余时间和完成百分比，生成 `ProgressEvent`

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 速度下限，避免 ETA 除零
const MIN_SPEED: f64 = 1e-9;

/// 进度回调
///
/// 每个 file_id 最多注册一个，重复注册会替换旧回调
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// 单个分片的传输样本（不持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub chunk_index: usize,
    pub start: u64,
    /// 结束偏移（不含）
    pub end: u64,
    /// 传输耗时（秒）
    pub transfer_time: f64,
    /// 传输速率（字节/秒）
    pub transfer_rate: f64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSample {
    pub fn new(chunk_index: usize, start: u64, end: u64, transfer_time: Duration) -> Self {
        let secs = transfer_time.as_secs_f64();
        let bytes = end.saturating_sub(start) as f64;
        let transfer_rate = if secs > 0.0 { bytes / secs } else { bytes / 1e-6 };
        Self {
            chunk_index,
            start,
            end,
            transfer_time: secs,
            transfer_rate,
            timestamp: Utc::now(),
        }
    }

    pub fn bytes(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// 进度事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// 分片完成
    ChunkCompleted {
        file_id: String,
        chunk_index: usize,
        completion_percentage: f64,
        bytes_remaining: u64,
        /// 平均速度（字节/秒）
        average_speed: f64,
        /// 最近一个分片的速度（字节/秒）
        current_speed: f64,
        /// 预计剩余时间（秒）
        estimated_time_remaining: f64,
        chunk_start: u64,
        chunk_end: u64,
        transfer_time: f64,
        transfer_rate: f64,
    },
    /// 操作恢复
    OperationResumed {
        file_id: String,
        completion_percentage: f64,
        remaining_chunks: Vec<usize>,
    },
}

impl ProgressEvent {
    pub fn file_id(&self) -> &str {
        match self {
            ProgressEvent::ChunkCompleted { file_id, .. }
            | ProgressEvent::OperationResumed { file_id, .. } => file_id,
        }
    }

    pub fn completion_percentage(&self) -> f64 {
        match self {
            ProgressEvent::ChunkCompleted {
                completion_percentage,
                ..
            }
            | ProgressEvent::OperationResumed {
                completion_percentage,
                ..
            } => *completion_percentage,
        }
    }
}

/// 进度统计器
///
/// 每个操作（在本引擎中附着的期间）一个
#[derive(Debug)]
pub struct ProgressReporter {
    file_id: String,
    /// 统计起点
    started_at: Instant,
    /// 本次附着以来传输的字节数
    bytes_transferred: u64,
    /// 最近一个样本
    last_sample: Option<ProgressSample>,
}

impl ProgressReporter {
    pub fn new(file_id: impl Into<String>) -> Self {
        Self::starting_at(file_id, Instant::now())
    }

    /// 指定统计起点
    pub fn starting_at(file_id: impl Into<String>, started_at: Instant) -> Self {
        Self {
            file_id: file_id.into(),
            started_at,
            bytes_transferred: 0,
            last_sample: None,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn last_sample(&self) -> Option<&ProgressSample> {
        self.last_sample.as_ref()
    }

    /// 平均速度 = 累计字节 / 起点以来的耗时
    pub fn average_speed(&self) -> f64 {
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / elapsed
    }

    /// 记录一个样本并生成分片完成事件
    pub fn record(
        &mut self,
        sample: ProgressSample,
        completion_percentage: f64,
        bytes_remaining: u64,
    ) -> ProgressEvent {
        self.bytes_transferred += sample.bytes();

        let average_speed = self.average_speed();
        let current_speed = sample.transfer_rate;
        let estimated_time_remaining = if bytes_remaining == 0 {
            0.0
        } else {
            bytes_remaining as f64 / average_speed.max(MIN_SPEED)
        };

        let event = ProgressEvent::ChunkCompleted {
            file_id: self.file_id.clone(),
            chunk_index: sample.chunk_index,
            completion_percentage,
            bytes_remaining,
            average_speed,
            current_speed,
            estimated_time_remaining,
            chunk_start: sample.start,
            chunk_end: sample.end,
            transfer_time: sample.transfer_time,
            transfer_rate: sample.transfer_rate,
        };
        self.last_sample = Some(sample);
        event
    }

    /// 生成恢复事件
    pub fn resumed(&self, completion_percentage: f64, remaining_chunks: Vec<usize>) -> ProgressEvent {
        ProgressEvent::OperationResumed {
            file_id: self.file_id.clone(),
            completion_percentage,
            remaining_chunks,
        }
    }
}

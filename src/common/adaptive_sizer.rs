//! 自适应分片大小
//!
//! 根据已完成分片的吞吐量推荐后续分片大小：
//! 1. 对最近 K 个样本的速率做指数加权移动平均（EWMA，alpha = 2/(K+1)）
//! 2. 新样本速率明显高于均值时放大，明显低于均值时缩小，落在阈值带内保持不变
//! 3. 结果始终夹在 [min_chunk_size, max_chunk_size] 内
//!
//! 推荐值只影响尚未创建的分片（复制/重新规划时），不会改动已有分片

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::config::AdaptiveConfig;

/// 计算速率时的最小耗时，避免除零
const MIN_TRANSFER_SECS: f64 = 1e-6;

/// 自适应分片大小计算器
#[derive(Debug, Clone)]
pub struct AdaptiveSizer {
    config: AdaptiveConfig,
    /// 最近的速率样本（字节/秒）
    samples: VecDeque<f64>,
    /// 当前推荐分片大小
    optimal_chunk_size: u64,
}

impl AdaptiveSizer {
    /// 以初始分片大小创建
    pub fn new(config: AdaptiveConfig, initial_chunk_size: u64) -> Self {
        let window = config.window.max(1);
        let mut sizer = Self {
            config,
            samples: VecDeque::with_capacity(window),
            optimal_chunk_size: 0,
        };
        sizer.optimal_chunk_size = sizer.clamp(initial_chunk_size);
        sizer
    }

    /// 夹到配置范围内（min 优先于 max）
    fn clamp(&self, size: u64) -> u64 {
        size.min(self.config.max_chunk_size)
            .max(self.config.min_chunk_size)
            .max(1)
    }

    /// 当前推荐分片大小
    pub fn optimal_chunk_size(&self) -> u64 {
        self.optimal_chunk_size
    }

    /// 样本数
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// 当前窗口内的移动平均速率
    pub fn average_rate(&self) -> Option<f64> {
        let alpha = 2.0 / (self.config.window.max(1) as f64 + 1.0);
        let mut iter = self.samples.iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |avg, rate| alpha * rate + (1.0 - alpha) * avg))
    }

    /// 记录一个已完成分片，返回新的推荐分片大小
    ///
    /// 新样本速率与加入它之前的均值 `avg` 比较：
    /// - 高于 `avg * (1 + threshold)`：乘以 `increase_factor`
    /// - 低于 `avg * (1 - threshold)`：乘以 `decrease_factor`
    /// - 落在 ±threshold 带内（含边界）：保持不变
    ///
    /// 第一个样本没有均值可比，总是保持不变
    pub fn record(&mut self, bytes: u64, transfer_time: Duration) -> u64 {
        let secs = transfer_time.as_secs_f64().max(MIN_TRANSFER_SECS);
        let rate = bytes as f64 / secs;

        // 与加入新样本前的均值比较
        let factor = match self.average_rate() {
            Some(avg) if rate > avg * (1.0 + self.config.threshold) => self.config.increase_factor,
            Some(avg) if rate < avg * (1.0 - self.config.threshold) => self.config.decrease_factor,
            _ => 1.0,
        };

        if self.samples.len() >= self.config.window.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(rate);

        let next = (self.optimal_chunk_size as f64 * factor).round() as u64;
        let next = self.clamp(next);

        if next != self.optimal_chunk_size {
            debug!(
                "自适应分片: {:.2} KB/s, {} -> {} bytes",
                rate / 1024.0,
                self.optimal_chunk_size,
                next
            );
        }
        self.optimal_chunk_size = next;
        next
    }
}

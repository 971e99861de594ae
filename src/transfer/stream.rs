// 类文件流适配
//
// 在 TransferEngine 之上提供 read / write / seek / tell / close：
// - "wb"：写入先缓冲在分片内，分片的每个字节都写过之后才调用 write_chunk，close 时 finalize_write
// - "rb"：跨分片边界顺序读取，分片内剩余数据缓存在流中
//
// 没有大小提示的 "wb" 流在第一次 write 时以当时的结尾偏移作为总大小创建操作

use std::collections::BTreeMap;
use std::str::FromStr;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::backend::normalize_path;
use crate::error::{BackendError, Result, TransferError};
use crate::state::{Chunk, Direction};
use crate::transfer::engine::TransferEngine;
use crate::transfer::types::{FinalizeResult, ReadOptions, WriteOptions};

/// 打开模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// "rb"
    Read,
    /// "wb"
    Write,
}

impl FromStr for OpenMode {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rb" | "r" => Ok(OpenMode::Read),
            "wb" | "w" => Ok(OpenMode::Write),
            other => Err(TransferError::validation(format!(
                "不支持的打开模式: {}",
                other
            ))),
        }
    }
}

/// 打开参数
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// 写入总大小，提供时立即创建操作
    pub size_hint: Option<u64>,
    /// 分片大小，None 时使用引擎默认值
    pub chunk_size: Option<u64>,
    pub metadata: BTreeMap<String, String>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 写模式下一个分片的缓冲
///
/// `covered` 记录已写过的区间（相对分片起点，有序且互不相邻）
struct ChunkBuffer {
    start: u64,
    data: Vec<u8>,
    covered: Vec<(usize, usize)>,
}

impl ChunkBuffer {
    /// 标记 `[from, to)` 已写过，合并相交或相邻的区间
    fn mark(&mut self, from: usize, to: usize) {
        let mut merged = (from, to);
        let mut rest = Vec::with_capacity(self.covered.len() + 1);
        for &(a, b) in &self.covered {
            if b < merged.0 || a > merged.1 {
                rest.push((a, b));
            } else {
                merged = (merged.0.min(a), merged.1.max(b));
            }
        }
        rest.push(merged);
        rest.sort_unstable();
        self.covered = rest;
    }

    fn is_full(&self) -> bool {
        self.covered.as_slice() == [(0, self.data.len())]
    }
}

/// 可恢复流
pub struct ResumableStream {
    engine: TransferEngine,
    path: String,
    mode: OpenMode,
    options: OpenOptions,
    /// 操作句柄（无大小提示的写入流在第一次 write 前为 None）
    file_id: Option<String>,
    /// 分片布局快照
    chunks: Vec<Chunk>,
    total_size: u64,
    position: u64,
    /// 写模式：尚未写出的分片缓冲
    pending: BTreeMap<usize, ChunkBuffer>,
    /// 读模式：最近读取的分片
    cached: Option<(usize, Vec<u8>)>,
    closed: bool,
    finalize_result: Option<FinalizeResult>,
}

/// 定位偏移所在分片
fn locate(chunks: &[Chunk], offset: u64) -> Option<usize> {
    let pos = chunks.partition_point(|c| c.start <= offset);
    pos.checked_sub(1).filter(|&i| chunks[i].contains(offset))
}

/// 把失败的分片结果转成流错误
fn chunk_failure(index: usize, error: Option<String>) -> TransferError {
    TransferError::Backend(BackendError::Io(format!(
        "分片 #{} 传输失败: {}",
        index,
        error.unwrap_or_default()
    )))
}

impl ResumableStream {
    pub fn file_id(&self) -> Option<&str> {
        self.file_id.as_deref()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 流的逻辑大小（无大小提示的写入流在第一次 write 前为 0）
    pub fn len(&self) -> u64 {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前游标
    pub fn tell(&self) -> u64 {
        self.position
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(TransferError::Concurrency(format!("流已关闭: {}", self.path)));
        }
        Ok(())
    }

    fn ensure_mode(&self, mode: OpenMode) -> Result<()> {
        if self.mode != mode {
            return Err(TransferError::validation(format!(
                "流以 {:?} 模式打开，不支持该操作",
                self.mode
            )));
        }
        Ok(())
    }

    /// 移动游标
    ///
    /// 写模式下部分写过的分片缓冲保留在流中，之后可以回来补齐
    pub async fn seek(&mut self, offset: u64) -> Result<u64> {
        self.ensure_open()?;

        if self.file_id.is_some() && offset > self.total_size {
            return Err(TransferError::validation(format!(
                "偏移越界: {} (大小 {})",
                offset, self.total_size
            )));
        }

        self.position = offset;
        Ok(offset)
    }

    /// 为写入流创建操作并载入分片布局
    async fn start_write(&mut self, total_size: u64) -> Result<()> {
        let options = WriteOptions {
            chunk_size: self.options.chunk_size,
            metadata: self.options.metadata.clone(),
            ..WriteOptions::default()
        };
        let file_id = self
            .engine
            .start_resumable_write(&self.path, total_size, options)
            .await?;

        let state = self.engine.load_state(&file_id)?;
        self.total_size = state.total_size;
        self.chunks = state.chunks;
        self.file_id = Some(file_id);
        Ok(())
    }

    /// 接续同一路径未完成的读取操作，没有时开始新的读取
    async fn start_read(&mut self) -> Result<()> {
        let outstanding = self
            .engine
            .list_resumable_operations()?
            .into_iter()
            .filter(|s| s.direction == Direction::Read && s.file_path == self.path && !s.completed)
            .max_by_key(|s| s.updated_at);

        let file_id = match outstanding {
            Some(summary) => {
                info!(
                    "读取流接续未完成的操作: {} (file_id={}, {:.1}%)",
                    self.path, summary.file_id, summary.completion_percentage
                );
                self.engine.resume_operation(&summary.file_id).await?;
                summary.file_id
            }
            None => {
                let read_options = ReadOptions {
                    chunk_size: self.options.chunk_size,
                    metadata: self.options.metadata.clone(),
                    ..ReadOptions::default()
                };
                self.engine
                    .start_resumable_read(&self.path, read_options)
                    .await?
            }
        };

        let state = self.engine.load_state(&file_id)?;
        self.total_size = state.total_size;
        self.chunks = state.chunks;
        self.file_id = Some(file_id);
        Ok(())
    }

    /// 写入数据，返回写入字节数
    ///
    /// 分片全部字节写过后立即写出；写出失败时缓冲保留，close 时重试
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        self.ensure_mode(OpenMode::Write)?;

        if self.file_id.is_none() {
            if data.is_empty() {
                return Ok(0);
            }
            let total_size = self.position + data.len() as u64;
            self.start_write(total_size).await?;
            info!(
                "无大小提示的写入流以 {} bytes 创建操作: {}",
                total_size, self.path
            );
        }

        if self.position + data.len() as u64 > self.total_size {
            return Err(TransferError::validation(format!(
                "写入超出声明大小: 偏移 {} + {} bytes > {}",
                self.position,
                data.len(),
                self.total_size
            )));
        }

        let mut written = 0;
        while written < data.len() {
            let index = locate(&self.chunks, self.position).ok_or_else(|| {
                TransferError::validation(format!("偏移 {} 不属于任何分片", self.position))
            })?;
            self.load_buffer(index).await?;

            let buf = self
                .pending
                .get_mut(&index)
                .ok_or_else(|| TransferError::Concurrency("写缓冲不可用".to_string()))?;
            let offset_in_chunk = (self.position - buf.start) as usize;
            let n = (buf.data.len() - offset_in_chunk).min(data.len() - written);
            buf.data[offset_in_chunk..offset_in_chunk + n]
                .copy_from_slice(&data[written..written + n]);
            buf.mark(offset_in_chunk, offset_in_chunk + n);
            let full = buf.is_full();

            written += n;
            self.position += n as u64;

            if full {
                self.flush_chunk(index).await?;
            }
        }

        Ok(written)
    }

    /// 确保 `index` 分片有缓冲
    ///
    /// 已完成的分片从后端预读原内容并视为全部写过，局部覆盖不会丢失其余字节
    async fn load_buffer(&mut self, index: usize) -> Result<()> {
        if self.pending.contains_key(&index) {
            return Ok(());
        }

        let file_id = self.require_file_id()?;
        let state = self.engine.load_state(&file_id)?;
        let chunk = state.chunk(index)?.clone();
        let size = chunk.size as usize;

        let (data, covered) = if chunk.status.is_completed() {
            let mut existing = self
                .engine
                .backend()
                .read(&state.file_path, chunk.start, chunk.size)
                .await?;
            existing.resize(size, 0);
            (existing, vec![(0, size)])
        } else {
            (vec![0u8; size], Vec::new())
        };

        self.pending.insert(
            index,
            ChunkBuffer {
                start: chunk.start,
                data,
                covered,
            },
        );
        Ok(())
    }

    /// 写出一个完整的分片缓冲，成功后释放
    async fn flush_chunk(&mut self, index: usize) -> Result<()> {
        let file_id = self.require_file_id()?;
        let Some(buf) = self.pending.get(&index) else {
            return Ok(());
        };

        let result = self.engine.write_chunk(&file_id, index, &buf.data).await?;
        if !result.success {
            return Err(chunk_failure(index, result.error));
        }
        self.pending.remove(&index);

        debug!(
            "流刷出分片 #{}: {} ({:.1}%)",
            result.chunk_index, self.path, result.completion_percentage
        );
        Ok(())
    }

    /// 写出所有已写满的缓冲（此前写出失败的分片在这里重试）
    async fn flush_full(&mut self) -> Result<()> {
        let full: Vec<usize> = self
            .pending
            .iter()
            .filter(|(_, buf)| buf.is_full())
            .map(|(&index, _)| index)
            .collect();
        for index in full {
            self.flush_chunk(index).await?;
        }
        Ok(())
    }

    /// 读取数据
    ///
    /// `size == None` 时读到结尾；到达结尾后返回空
    pub async fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.ensure_mode(OpenMode::Read)?;

        let available = self.total_size.saturating_sub(self.position);
        let wanted = match size {
            Some(n) => (n as u64).min(available),
            None => available,
        } as usize;

        let mut out = Vec::with_capacity(wanted);
        while out.len() < wanted {
            let index = locate(&self.chunks, self.position).ok_or_else(|| {
                TransferError::validation(format!("偏移 {} 不属于任何分片", self.position))
            })?;
            let offset_in_chunk = (self.position - self.chunks[index].start) as usize;
            let remaining = wanted - out.len();

            let data = self.chunk_data(index).await?;
            let n = data.len().saturating_sub(offset_in_chunk).min(remaining);
            if n == 0 {
                return Err(chunk_failure(index, Some("分片数据为空".to_string())));
            }
            out.extend_from_slice(&data[offset_in_chunk..offset_in_chunk + n]);
            self.position += n as u64;
        }

        Ok(out)
    }

    /// 取分片数据（优先使用缓存）
    async fn chunk_data(&mut self, index: usize) -> Result<&[u8]> {
        let hit = matches!(&self.cached, Some((cached, _)) if *cached == index);
        if !hit {
            let file_id = self.require_file_id()?;
            let result = self.engine.read_chunk(&file_id, index).await?;
            if !result.success {
                return Err(chunk_failure(index, result.error));
            }
            self.cached = Some((index, result.chunk_data));
        }

        match &self.cached {
            Some((_, data)) => Ok(data.as_slice()),
            None => Err(TransferError::Concurrency("读缓存不可用".to_string())),
        }
    }

    fn require_file_id(&self) -> Result<String> {
        self.file_id
            .clone()
            .ok_or_else(|| TransferError::Concurrency(format!("流尚未创建操作: {}", self.path)))
    }

    /// 关闭流
    ///
    /// 写模式刷出剩余缓冲并 finalize_write；读模式只有全部分片都读过时才 finalize_read，
    /// 否则操作保留，之后可以再次以 "rb" 打开同一路径继续。重复关闭返回第一次的结果
    pub async fn close(&mut self) -> Result<Option<FinalizeResult>> {
        if self.closed {
            return Ok(self.finalize_result.clone());
        }

        let result = match self.mode {
            OpenMode::Write => self.close_write().await,
            OpenMode::Read => self.close_read().await,
        };

        // 无论成功与否都视为已关闭，未完成的操作仍可通过 file_id 恢复
        self.closed = true;
        self.cached = None;
        self.pending.clear();
        self.finalize_result = result.as_ref().ok().cloned().flatten();
        result
    }

    async fn close_write(&mut self) -> Result<Option<FinalizeResult>> {
        if self.file_id.is_none() {
            // 从未写过数据：得到一个空对象
            self.start_write(0).await?;
        }
        self.flush_full().await?;

        if !self.pending.is_empty() {
            let partial: Vec<usize> = self.pending.keys().copied().collect();
            warn!(
                "写入流关闭时仍有未写满的分片 {:?}: {}，这些分片不会写出",
                partial, self.path
            );
        }

        let file_id = self.require_file_id()?;
        let result = self.engine.finalize_write(&file_id).await?;
        info!("写入流已关闭: {} (file_id={})", self.path, file_id);
        Ok(Some(result))
    }

    async fn close_read(&mut self) -> Result<Option<FinalizeResult>> {
        let file_id = self.require_file_id()?;
        let state = self.engine.load_state(&file_id)?;
        if !state.completed {
            debug!(
                "读取流关闭时未读完 ({:.1}%)，保留操作: file_id={}",
                state.completion_percentage(),
                file_id
            );
            return Ok(None);
        }

        let result = self.engine.finalize_read(&file_id).await?;
        info!("读取流已关闭: {} (file_id={})", self.path, file_id);
        Ok(Some(result))
    }
}

impl Drop for ResumableStream {
    fn drop(&mut self) {
        if !self.closed {
            warn!(
                "流未关闭就被释放: {} (file_id={:?})，缓冲数据未写出",
                self.path, self.file_id
            );
        }
    }
}

/// 打开可恢复流
///
/// - "wb"：有 `size_hint` 时立即开始可恢复写入；否则第一次 write 时创建操作
/// - "rb"：同一路径存在未完成的读取操作时接着它继续，否则开始新的读取
pub async fn open_resumable(
    engine: &TransferEngine,
    path: &str,
    mode: &str,
    options: OpenOptions,
) -> Result<ResumableStream> {
    let mode: OpenMode = mode.parse()?;
    let path = normalize_path(path).map_err(|e| TransferError::validation(e.to_string()))?;
    let size_hint = options.size_hint;

    let mut stream = ResumableStream {
        engine: engine.clone(),
        path,
        mode,
        options,
        file_id: None,
        chunks: Vec::new(),
        total_size: 0,
        position: 0,
        pending: BTreeMap::new(),
        cached: None,
        closed: false,
        finalize_result: None,
    };

    let opened = match (mode, size_hint) {
        (OpenMode::Write, Some(size)) => stream.start_write(size).await,
        (OpenMode::Write, None) => Ok(()),
        (OpenMode::Read, _) => stream.start_read().await,
    };
    if let Err(e) = opened {
        // 没有可关闭的内容
        stream.closed = true;
        return Err(e);
    }

    Ok(stream)
}

/// 作用域内使用流，`body` 无论成功失败都会关闭流
///
/// `body` 出错时返回 `body` 的错误（关闭错误只记录日志）
pub async fn with_resumable<T, F>(
    engine: &TransferEngine,
    path: &str,
    mode: &str,
    options: OpenOptions,
    body: F,
) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut ResumableStream) -> BoxFuture<'a, Result<T>>,
{
    let mut stream = open_resumable(engine, path, mode, options).await?;
    let outcome = body(&mut stream).await;
    let closed = stream.close().await;

    match (outcome, closed) {
        (Ok(value), Ok(_)) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), close_result) => {
            if let Err(close_err) = close_result {
                warn!("作用域流关闭失败: {}", close_err);
            }
            Err(e)
        }
    }
}

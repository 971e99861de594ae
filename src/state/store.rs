//! 状态文件读写
//!
//! 每个 file_id 对应 `{state_dir}/{file_id}.state.json`，
//! 保存时先写临时文件再原子重命名，读者永远看不到写了一半的文件
//!
//! ```text
//! state/
//! ├── {file_id}.state.json
//! └── {file_id}.state.json.tmp   # 仅在保存过程中短暂存在
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use super::types::{FileState, StateSummary, STATE_SCHEMA_VERSION};
use crate::error::{Result, TransferError};

/// 状态文件后缀
const STATE_SUFFIX: &str = ".state.json";

/// 临时文件后缀
const TEMP_SUFFIX: &str = ".state.json.tmp";

/// 状态存储
#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    /// 创建状态存储（目录在首次保存时创建）
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    /// 状态目录
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// 获取状态文件路径
    pub fn state_path(&self, file_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}{}", file_id, STATE_SUFFIX))
    }

    fn temp_path(&self, file_id: &str) -> PathBuf {
        self.state_dir.join(format!("{}{}", file_id, TEMP_SUFFIX))
    }

    /// 状态是否存在
    pub fn exists(&self, file_id: &str) -> bool {
        self.state_path(file_id).exists()
    }

    /// 保存状态（整体覆盖）
    pub fn save(&self, file_id: &str, state: &FileState) -> Result<()> {
        validate_file_id(file_id)?;
        self.write_atomic(file_id, state)
            .map_err(|e| TransferError::persistence(file_id, e))?;

        debug!(
            "已保存状态: file_id={}, 进度={:.1}%",
            file_id,
            state.completion_percentage()
        );
        Ok(())
    }

    fn write_atomic(&self, file_id: &str, state: &FileState) -> io::Result<()> {
        if !self.state_dir.exists() {
            fs::create_dir_all(&self.state_dir)?;
            debug!("已创建状态目录: {:?}", self.state_dir);
        }

        let path = self.state_path(file_id);
        let temp_path = self.temp_path(file_id);

        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);

        serde_json::to_writer_pretty(&mut writer, state).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to serialize state: {}", e),
            )
        })?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        // 原子重命名
        fs::rename(&temp_path, &path)
    }

    /// 加载状态
    ///
    /// - 文件不存在：`NotFound`
    /// - 解析失败、版本不支持或分片不变量被破坏：`CorruptState`
    pub fn load(&self, file_id: &str) -> Result<FileState> {
        validate_file_id(file_id)?;
        let path = self.state_path(file_id);

        if !path.exists() {
            return Err(TransferError::NotFound(format!("file_id={}", file_id)));
        }

        let state = load_from_path(&path).map_err(|reason| TransferError::CorruptState {
            file_id: file_id.to_string(),
            reason,
        })?;

        if state.file_id != file_id {
            return Err(TransferError::CorruptState {
                file_id: file_id.to_string(),
                reason: format!("记录中的 file_id 为 {}", state.file_id),
            });
        }

        debug!("已加载状态: {:?}", path);
        Ok(state)
    }

    /// 列出所有持久化状态的摘要
    ///
    /// 损坏的状态文件只影响它自己，会被跳过
    pub fn list(&self) -> Result<Vec<StateSummary>> {
        let mut summaries: Vec<StateSummary> = self
            .scan_states()?
            .into_iter()
            .map(|state| state.summary())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    /// 扫描所有可解析的状态
    pub fn scan_states(&self) -> Result<Vec<FileState>> {
        if !self.state_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.state_dir)
            .map_err(|e| TransferError::persistence("*", e))?;

        let mut states = Vec::new();
        let mut skipped = 0;

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(file_id) = file_id_from_path(&path) else {
                continue;
            };

            match load_from_path(&path) {
                Ok(state) => states.push(state),
                Err(reason) => {
                    warn!("跳过损坏的状态文件 {:?} (file_id={}): {}", path, file_id, reason);
                    skipped += 1;
                }
            }
        }

        if skipped > 0 {
            warn!("扫描状态完成，跳过 {} 个损坏文件", skipped);
        }

        Ok(states)
    }

    /// 删除状态
    ///
    /// 返回是否真的删除了文件
    pub fn delete(&self, file_id: &str) -> Result<bool> {
        validate_file_id(file_id)?;
        let path = self.state_path(file_id);

        // 顺带清理残留的临时文件
        let temp_path = self.temp_path(file_id);
        if temp_path.exists() {
            if let Err(e) = fs::remove_file(&temp_path) {
                warn!("删除临时状态文件失败 {:?}: {}", temp_path, e);
            }
        }

        if path.exists() {
            fs::remove_file(&path).map_err(|e| TransferError::persistence(file_id, e))?;
            debug!("已删除状态文件: {:?}", path);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// 清理过期状态
    ///
    /// `updated_at` 早于保留期的状态会被删除，返回删除的 file_id
    pub fn cleanup_expired(&self, retention_days: u64) -> Result<Vec<String>> {
        let cutoff = Utc::now() - Duration::days(retention_days as i64);
        let mut removed = Vec::new();

        for state in self.scan_states()? {
            if state.updated_at < cutoff && self.delete(&state.file_id)? {
                removed.push(state.file_id);
            }
        }

        if !removed.is_empty() {
            info!("已清理 {} 个过期状态 (保留 {} 天)", removed.len(), retention_days);
        }

        Ok(removed)
    }
}

/// 从路径解析 file_id，非状态文件返回 None
fn file_id_from_path(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(STATE_SUFFIX).map(|id| id.to_string())
}

/// 从指定路径加载状态，错误以文本描述返回
fn load_from_path(path: &Path) -> std::result::Result<FileState, String> {
    let file = File::open(path).map_err(|e| format!("打开失败: {}", e))?;
    let reader = BufReader::new(file);

    let state: FileState =
        serde_json::from_reader(reader).map_err(|e| format!("Failed to parse state: {}", e))?;

    if state.schema_version > STATE_SCHEMA_VERSION {
        return Err(format!(
            "不支持的状态版本 {} (当前 {})",
            state.schema_version, STATE_SCHEMA_VERSION
        ));
    }

    state.validate()?;
    Ok(state)
}

/// file_id 只能作为单层文件名使用
fn validate_file_id(file_id: &str) -> Result<()> {
    if file_id.is_empty()
        || file_id.contains('/')
        || file_id.contains('\\')
        || file_id.contains("..")
    {
        return Err(TransferError::validation(format!("非法 file_id: {:?}", file_id)));
    }
    Ok(())
}

// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// 传输配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferConfig {
    /// 引擎配置
    #[serde(default)]
    pub engine: EngineConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 自适应分片配置
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 单次分片调用超时（秒）
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// 单个分片的最大重试次数（不含首次）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 完成后是否保留状态文件（审计用）
    #[serde(default)]
    pub retain_completed_state: bool,
    /// 默认分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: u64,
}

fn default_chunk_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024 // 4MB
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_timeout_secs: default_chunk_timeout_secs(),
            max_retries: default_max_retries(),
            retain_completed_state: false,
            default_chunk_size: default_chunk_size(),
        }
    }
}

impl EngineConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 状态文件目录
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// 未完成状态保留天数
    #[serde(default = "default_state_retention_days")]
    pub retention_days: u64,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_state_retention_days() -> u64 {
    7
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            retention_days: default_state_retention_days(),
        }
    }
}

/// 自适应分片配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// 最小分片大小
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// 最大分片大小
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// 移动平均窗口（样本数）
    #[serde(default = "default_window")]
    pub window: usize,
    /// 提速时的放大倍数
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
    /// 降速时的缩小倍数
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
    /// 相对阈值（0.1 表示偏离均值 10% 才调整）
    #[serde(default = "default_threshold")]
    pub threshold: f64,
}

fn default_min_chunk_size() -> u64 {
    256 * 1024 // 256KB
}

fn default_max_chunk_size() -> u64 {
    64 * 1024 * 1024 // 64MB
}

fn default_window() -> usize {
    8
}

fn default_increase_factor() -> f64 {
    1.5
}

fn default_decrease_factor() -> f64 {
    0.5
}

fn default_threshold() -> f64 {
    0.1
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            window: default_window(),
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
            threshold: default_threshold(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

impl TransferConfig {
    /// 以指定状态目录创建默认配置
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.persistence.state_dir = state_dir.into();
        config
    }

    /// 检查配置取值
    pub fn validate(&self) -> Result<()> {
        if self.engine.default_chunk_size == 0 {
            anyhow::bail!("engine.default_chunk_size 必须大于 0");
        }
        if self.engine.chunk_timeout_secs == 0 {
            anyhow::bail!("engine.chunk_timeout_secs 必须大于 0");
        }

        let adaptive = &self.adaptive;
        if adaptive.min_chunk_size == 0 || adaptive.min_chunk_size > adaptive.max_chunk_size {
            anyhow::bail!(
                "adaptive 分片范围无效: min={} max={}",
                adaptive.min_chunk_size,
                adaptive.max_chunk_size
            );
        }
        if adaptive.window == 0 {
            anyhow::bail!("adaptive.window 必须大于 0");
        }
        if adaptive.increase_factor < 1.0 || !(0.0..=1.0).contains(&adaptive.decrease_factor) {
            anyhow::bail!(
                "adaptive 倍数无效: increase={} decrease={}",
                adaptive.increase_factor,
                adaptive.decrease_factor
            );
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: TransferConfig =
            toml::from_str(&content).context("Failed to parse config file")?;

        config.validate().context("配置文件取值无效")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载配置，失败时使用默认配置并尝试写回
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

//! 上传配置

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::core::{UploadError, DEFAULT_PRIORITY};
use crate::utils::RetryStrategy;

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

/// 队列、引擎与校验器共用的配置，所有时长以毫秒表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// 单个文件的大小上限
    pub max_size: u64,
    /// 允许的 MIME 类型，支持 `*/*` 与 `image/*`
    pub allowed_types: Vec<String>,
    /// 未结束任务的数量上限
    pub max_files: Option<usize>,
    pub chunk_size: u64,
    /// 超过该大小使用分片上传
    pub chunk_threshold: u64,
    pub max_concurrent_chunks: usize,
    /// 同时上传的任务数
    pub max_concurrent: usize,
    /// 任务级重试次数
    pub max_retries: u32,
    /// 单个分片的重试次数
    pub max_chunk_retries: u32,
    /// 失败后立即重新排队
    pub auto_retry: bool,
    /// 任一任务失败后暂停调度
    pub pause_on_error: bool,
    /// 默认优先级，越大越先
    pub priority: i32,
    #[serde(with = "option_duration_ms")]
    pub chunk_timeout: Option<Duration>,
    #[serde(with = "option_duration_ms")]
    pub item_timeout: Option<Duration>,
    pub retry_strategy: RetryStrategy,
    /// 进度汇报间隔
    #[serde(with = "duration_ms")]
    pub progress_interval: Duration,
    /// 进度通道容量，满了直接丢弃
    pub progress_buffer: usize,
    /// 完成后多久自动清理
    #[serde(with = "option_duration_ms")]
    pub auto_clear_after: Option<Duration>,
    pub reject_reserved_names: bool,
    pub block_executables: bool,
    /// 签名识别读取的字节数
    pub signature_sniff_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: 10 * MB,
            allowed_types: vec!["*/*".to_string()],
            max_files: None,
            chunk_size: MB,
            chunk_threshold: MB,
            max_concurrent_chunks: 3,
            max_concurrent: 3,
            max_retries: 3,
            max_chunk_retries: 3,
            auto_retry: false,
            pause_on_error: false,
            priority: DEFAULT_PRIORITY,
            chunk_timeout: Some(Duration::from_secs(60)),
            item_timeout: None,
            retry_strategy: RetryStrategy::default(),
            progress_interval: Duration::from_millis(250),
            progress_buffer: 64,
            auto_clear_after: None,
            reject_reserved_names: true,
            block_executables: true,
            signature_sniff_bytes: 64,
        }
    }
}

impl UploadConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, UploadError> {
        let config: UploadConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), UploadError> {
        if self.max_concurrent == 0 {
            return Err(UploadError::Config("max_concurrent must be at least 1".into()));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(UploadError::Config("max_concurrent_chunks must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk_size must be greater than 0".into()));
        }
        if self.progress_buffer == 0 {
            return Err(UploadError::Config("progress_buffer must be at least 1".into()));
        }
        if self.max_files == Some(0) {
            return Err(UploadError::Config("max_files must be at least 1".into()));
        }
        Ok(())
    }
}

/// 命令行配置文件
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    pub endpoint: String,
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl CliConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let content = fs::read_to_string(path)?;
        let config: CliConfig = toml::from_str(&content)?;
        config.upload.validate()?;
        Ok(config)
    }
}

/// `Duration` <-> 毫秒
pub mod duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

pub mod option_duration_ms {
    use std::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match duration {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use crate::validator::mime_for_extension;

/// 文件字节来源，引擎只读
#[async_trait]
pub trait FileSource: Send + Sync {
    /// 读取 `[start, end)` 区间
    async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes>;
}

/// 内存中的文件
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl FileSource for MemorySource {
    async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
        let len = self.data.len() as u64;
        if start > end || end > len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("range {start}..{end} out of bounds for {len} bytes"),
            ));
        }
        Ok(self.data.slice(start as usize..end as usize))
    }
}

/// 磁盘上的文件，每次读取都重新打开以便多个分片并发读
pub struct DiskSource {
    path: PathBuf,
}

impl DiskSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FileSource for DiskSource {
    async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
        let mut file = File::open(&self.path).await?;
        file.seek(SeekFrom::Start(start)).await?;

        let mut buffer = vec![0u8; end.saturating_sub(start) as usize];
        file.read_exact(&mut buffer).await?;

        Ok(Bytes::from(buffer))
    }
}

/// 文件句柄：元数据 + 字节访问
#[derive(Clone)]
pub struct FileRef {
    pub name: String,
    pub size: u64,
    /// 声明的 MIME 类型
    pub mime_type: String,
    pub last_modified: Option<DateTime<Utc>>,
    /// 内存数据的内容摘要
    fingerprint: Option<u64>,
    source: Arc<dyn FileSource>,
}

impl FileRef {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        mime_type: impl Into<String>,
        source: Arc<dyn FileSource>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            mime_type: mime_type.into(),
            last_modified: None,
            fingerprint: None,
            source,
        }
    }

    /// 内存数据，MIME 类型按扩展名推断
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let name = name.into();
        let data = data.into();
        let mime_type = guess_mime(&name);
        let mut hasher = DefaultHasher::new();
        data.hash(&mut hasher);
        let fingerprint = hasher.finish();
        let mut file = Self::new(name, data.len() as u64, mime_type, Arc::new(MemorySource::new(data)));
        file.fingerprint = Some(fingerprint);
        file
    }

    /// 从磁盘文件创建句柄
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a file", path.display()),
            ));
        }

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime_type = guess_mime(&name);
        let last_modified = metadata.modified().ok().map(DateTime::<Utc>::from);

        Ok(Self {
            name,
            size: metadata.len(),
            mime_type,
            last_modified,
            fingerprint: None,
            source: Arc::new(DiskSource::new(path)),
        })
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// 只有 [`FileRef::from_bytes`] 创建的句柄才有
    pub fn fingerprint(&self) -> Option<u64> {
        self.fingerprint
    }

    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
    }

    pub async fn read_range(&self, start: u64, end: u64) -> std::io::Result<Bytes> {
        self.source.read_range(start, end.min(self.size)).await
    }

    /// 读取文件头部，用于内容签名嗅探
    pub async fn read_header(&self, max_bytes: usize) -> std::io::Result<Bytes> {
        self.read_range(0, (max_bytes as u64).min(self.size)).await
    }

    pub async fn read_all(&self) -> std::io::Result<Bytes> {
        self.read_range(0, self.size).await
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .field("last_modified", &self.last_modified)
            .finish()
    }
}

fn guess_mime(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| mime_for_extension(&ext.to_ascii_lowercase()))
        .unwrap_or("application/octet-stream")
        .to_string()
}

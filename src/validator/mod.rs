//! 准入校验：大小、类型、文件名、内容签名与自定义规则

mod filename;
pub mod signature;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use crate::config::UploadConfig;
use crate::core::{FileRef, ValidationError, ValidationErrorKind};
use crate::utils::format_bytes;

pub use filename::MAX_FILENAME_LEN;
pub use types::{mime_allowed, mime_for_extension, normalize_mime, FileCategory};

/// 一条校验诊断
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: ValidationErrorKind,
    /// 细分代码，如 `extension-mismatch`
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: ValidationErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
        }
    }
}

/// 可以推导出的文件信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileMetadata {
    pub size: u64,
    pub category: FileCategory,
    pub extension: Option<String>,
    /// 从文件头识别出的类型
    pub detected_type: Option<String>,
    pub dimensions: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub accepted: bool,
    /// 阻断性错误
    pub errors: Vec<Diagnostic>,
    /// 非阻断警告
    pub warnings: Vec<Diagnostic>,
    pub metadata: FileMetadata,
}

impl ValidationResult {
    /// 有阻断性错误时转成 [`ValidationError`]，以第一条错误为准
    pub fn to_error(&self, filename: &str) -> Option<ValidationError> {
        let first = self.errors.first()?;
        Some(ValidationError {
            kind: first.kind,
            message: first.message.clone(),
            filename: filename.to_string(),
            diagnostics: self.errors.clone(),
        })
    }
}

/// 自定义校验结果
#[derive(Debug, Clone, Default)]
pub struct CustomReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl CustomReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self {
            errors: vec![message.into()],
            warnings: Vec::new(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            errors: Vec::new(),
            warnings: vec![message.into()],
        }
    }
}

/// 调用方提供的校验器
#[async_trait]
pub trait CustomValidator: Send + Sync {
    fn name(&self) -> &str;

    /// `header` 为文件开头的若干字节
    async fn validate(&self, file: &FileRef, header: &Bytes) -> CustomReport;
}

/// 校验规则
#[derive(Debug, Clone)]
pub struct ValidationRules {
    pub max_size: u64,
    pub allowed_types: Vec<String>,
    pub reject_reserved_names: bool,
    pub block_executables: bool,
    pub sniff_bytes: usize,
}

impl From<&UploadConfig> for ValidationRules {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_size: config.max_size,
            allowed_types: config.allowed_types.clone(),
            reject_reserved_names: config.reject_reserved_names,
            block_executables: config.block_executables,
            sniff_bytes: config.signature_sniff_bytes,
        }
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::from(&UploadConfig::default())
    }
}

/// 名称、大小、声明类型、修改时间、内容摘要
type CacheKey = (String, u64, String, Option<DateTime<Utc>>, Option<u64>);

/// 校验器
///
/// 相同 `(文件名, 大小, 修改时间)` 的结果会被缓存，直到校验器被丢弃。
pub struct Validator {
    rules: ValidationRules,
    custom: Vec<Arc<dyn CustomValidator>>,
    cache: Mutex<HashMap<CacheKey, ValidationResult>>,
}

impl Validator {
    pub fn new(rules: ValidationRules) -> Self {
        Self {
            rules,
            custom: Vec::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_custom(mut self, validator: Arc<dyn CustomValidator>) -> Self {
        self.custom.push(validator);
        self
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    /// 校验文件
    pub async fn validate(&self, file: &FileRef) -> ValidationResult {
        // 无法区分内容的文件不缓存
        if file.last_modified.is_none() && file.fingerprint().is_none() {
            return self.run_checks(file).await;
        }

        let key = (
            file.name.clone(),
            file.size,
            file.mime_type.clone(),
            file.last_modified,
            file.fingerprint(),
        );
        let cached = self.cache.lock().get(&key).cloned();
        if let Some(result) = cached {
            debug!(file = %file.name, "validation cache hit");
            return result;
        }

        let result = self.run_checks(file).await;
        self.cache.lock().insert(key, result.clone());
        result
    }

    /// 校验并在有阻断性错误时返回 [`ValidationError`]
    pub async fn admit(&self, file: &FileRef) -> Result<ValidationResult, ValidationError> {
        let result = self.validate(file).await;
        match result.to_error(&file.name) {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    async fn run_checks(&self, file: &FileRef) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 读取文件头是唯一的 I/O，和同步检查并行
        let header_future = async {
            if file.size == 0 {
                return Ok(Bytes::new());
            }
            file.read_header(self.rules.sniff_bytes).await
        };
        let sync_future = async {
            let mut errors = Vec::new();
            let mut warnings = Vec::new();
            self.check_size(file, &mut errors, &mut warnings);
            self.check_type(file, &mut errors, &mut warnings);
            filename::check_filename(&file.name, self.rules.reject_reserved_names, &mut errors, &mut warnings);
            if self.rules.block_executables {
                filename::check_executable_name(&file.name, &mut errors);
            }
            (errors, warnings)
        };
        let (header, (sync_errors, sync_warnings)) = tokio::join!(header_future, sync_future);
        errors.extend(sync_errors);
        warnings.extend(sync_warnings);

        let header = match header {
            Ok(header) => header,
            Err(err) => {
                errors.push(Diagnostic::new(
                    ValidationErrorKind::ContentMismatch,
                    "unreadable",
                    format!("file content could not be read: {err}"),
                ));
                Bytes::new()
            }
        };

        let detected = signature::detect(&header);
        if !header.is_empty() {
            self.check_signature(file, detected, &mut errors);
        }

        let reports = join_all(self.custom.iter().map(|validator| {
            let header = &header;
            async move { (validator.name().to_string(), validator.validate(file, header).await) }
        }))
        .await;

        for (name, report) in reports {
            errors.extend(
                report.errors.into_iter().map(|message| Diagnostic::new(ValidationErrorKind::Custom, name.clone(), message)),
            );
            warnings.extend(
                report.warnings.into_iter().map(|message| Diagnostic::new(ValidationErrorKind::Custom, name.clone(), message)),
            );
        }

        let declared = normalize_mime(&file.mime_type);
        let metadata = FileMetadata {
            size: file.size,
            category: FileCategory::from_mime(detected.map(|s| s.mime).unwrap_or(declared.as_str())),
            extension: file.extension(),
            detected_type: detected.map(|s| s.mime.to_string()),
            dimensions: signature::dimensions(&header),
        };

        ValidationResult {
            accepted: errors.is_empty(),
            errors,
            warnings,
            metadata,
        }
    }

    fn check_size(&self, file: &FileRef, errors: &mut Vec<Diagnostic>, warnings: &mut Vec<Diagnostic>) {
        if file.size > self.rules.max_size {
            errors.push(Diagnostic::new(
                ValidationErrorKind::TooLarge,
                "too-large",
                format!(
                    "file is {}, limit is {}",
                    format_bytes(file.size),
                    format_bytes(self.rules.max_size)
                ),
            ));
        } else if file.size == 0 {
            warnings.push(Diagnostic::new(ValidationErrorKind::TooLarge, "empty-file", "file is empty"));
        }
    }

    fn check_type(&self, file: &FileRef, errors: &mut Vec<Diagnostic>, warnings: &mut Vec<Diagnostic>) {
        let declared = normalize_mime(&file.mime_type);

        if !mime_allowed(&declared, &self.rules.allowed_types) {
            errors.push(Diagnostic::new(
                ValidationErrorKind::InvalidType,
                "type-not-allowed",
                format!("type {declared} is not allowed"),
            ));
        }

        // 扩展名与声明类型不一致只是警告
        if let Some(expected) = file.extension().as_deref().and_then(mime_for_extension) {
            if expected != declared {
                warnings.push(Diagnostic::new(
                    ValidationErrorKind::InvalidType,
                    "extension-mismatch",
                    format!("extension suggests {expected} but type is declared as {declared}"),
                ));
            }
        }
    }

    fn check_signature(&self, file: &FileRef, detected: Option<signature::Signature>, errors: &mut Vec<Diagnostic>) {
        let declared = normalize_mime(&file.mime_type);
        let expected_family = signature::declared_family(&declared);
        let declared_executable = FileCategory::from_mime(&declared) == FileCategory::Executable;
        // "MZ" 和 "#!" 太短，文本文件以它们开头很常见
        let conclusive = |found: &signature::Signature| {
            found.strong || expected_family.is_some() || !is_textual(&declared)
        };

        match (detected, expected_family) {
            (Some(found), Some(family)) if found.family == family => {}
            (Some(found), _) if found.executable && !declared_executable && conclusive(&found) => {
                errors.push(Diagnostic::new(
                    ValidationErrorKind::SecurityFlagged,
                    "executable-content",
                    format!("content looks like {} but is declared as {declared}", found.mime),
                ));
            }
            (Some(found), Some(_)) => {
                errors.push(Diagnostic::new(
                    ValidationErrorKind::ContentMismatch,
                    "signature-mismatch",
                    format!("content looks like {} but is declared as {declared}", found.mime),
                ));
            }
            (Some(found), None) => {
                if found.strong && declared != "application/octet-stream" {
                    errors.push(Diagnostic::new(
                        ValidationErrorKind::ContentMismatch,
                        "signature-mismatch",
                        format!("content looks like {} but is declared as {declared}", found.mime),
                    ));
                }
            }
            (None, Some(_)) => {
                errors.push(Diagnostic::new(
                    ValidationErrorKind::ContentMismatch,
                    "missing-signature",
                    format!("content does not start with a valid {declared} signature"),
                ));
            }
            (None, None) => {}
        }
    }
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/") || mime == "application/json"
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidationRules::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use super::signature::fixtures::png_header;

    fn rules() -> ValidationRules {
        ValidationRules {
            max_size: 1024 * 1024,
            allowed_types: vec!["*/*".to_string()],
            reject_reserved_names: true,
            block_executables: true,
            sniff_bytes: 64,
        }
    }

    fn codes(diagnostics: &[Diagnostic]) -> Vec<&str> {
        diagnostics.iter().map(|d| d.code.as_str()).collect()
    }

    #[tokio::test]
    async fn test_accepts_valid_png() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("photo.png", png_header());

        let result = validator.validate(&file).await;
        assert!(result.accepted, "{:?}", result.errors);
        assert!(result.warnings.is_empty());
        assert_eq!(result.metadata.category, FileCategory::Image);
        assert_eq!(result.metadata.extension.as_deref(), Some("png"));
        assert_eq!(result.metadata.detected_type.as_deref(), Some("image/png"));
        assert_eq!(result.metadata.dimensions, Some((640, 480)));
    }

    #[tokio::test]
    async fn test_too_large() {
        let validator = Validator::new(ValidationRules { max_size: 10, ..rules() });
        let file = FileRef::from_bytes("notes.txt", b"more than ten bytes".to_vec());

        let err = validator.admit(&file).await.unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::TooLarge);
        assert_eq!(err.filename, "notes.txt");
    }

    #[tokio::test]
    async fn test_type_not_allowed() {
        let validator = Validator::new(ValidationRules {
            allowed_types: vec!["image/*".to_string()],
            ..rules()
        });
        let file = FileRef::from_bytes("notes.txt", b"hello".to_vec());

        let result = validator.validate(&file).await;
        assert!(!result.accepted);
        assert_eq!(codes(&result.errors), vec!["type-not-allowed"]);
    }

    #[tokio::test]
    async fn test_extension_mismatch_is_warning() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("readme.md", b"# title".to_vec()).with_mime_type("text/plain");

        let result = validator.validate(&file).await;
        assert!(result.accepted);
        assert_eq!(codes(&result.warnings), vec!["extension-mismatch"]);
    }

    #[tokio::test]
    async fn test_signature_mismatch_is_error() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("photo.png", b"%PDF-1.7 not an image".to_vec());

        let err = validator.admit(&file).await.unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::ContentMismatch);
    }

    #[tokio::test]
    async fn test_missing_signature_is_error() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("scan.pdf", b"plain text pretending".to_vec());

        let result = validator.validate(&file).await;
        assert_eq!(codes(&result.errors), vec!["missing-signature"]);
    }

    #[tokio::test]
    async fn test_disguised_executable_is_flagged() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("cat.jpg", b"MZ\x90\x00\x03\x00\x00\x00".to_vec());

        let err = validator.admit(&file).await.unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::SecurityFlagged);
    }

    #[tokio::test]
    async fn test_text_with_weak_executable_prefix_is_accepted() {
        let validator = Validator::new(rules());

        let notes = FileRef::from_bytes("notes.txt", b"MZ Racing meeting notes\n".to_vec());
        let result = validator.validate(&notes).await;
        assert!(result.accepted, "{:?}", result.errors);

        let readme = FileRef::from_bytes("setup.md", b"#!/bin/sh is the first line of every script\n".to_vec());
        let result = validator.validate(&readme).await;
        assert!(result.accepted, "{:?}", result.errors);

        // 二进制类型仍然拦截
        let blob = FileRef::from_bytes("payload.bin", b"MZ\x90\x00\x03\x00".to_vec());
        let err = validator.admit(&blob).await.unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::SecurityFlagged);
    }

    #[tokio::test]
    async fn test_executable_extension_is_flagged() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("invoice.pdf.exe", b"MZ\x90\x00".to_vec());

        let result = validator.validate(&file).await;
        assert!(!result.accepted);
        assert!(result.errors.iter().all(|d| d.kind == ValidationErrorKind::SecurityFlagged));
    }

    #[tokio::test]
    async fn test_empty_file_warns() {
        let validator = Validator::new(rules());
        let file = FileRef::from_bytes("empty.txt", Vec::new());

        let result = validator.validate(&file).await;
        assert!(result.accepted);
        assert_eq!(codes(&result.warnings), vec!["empty-file"]);
    }

    struct NoSpaces;

    #[async_trait]
    impl CustomValidator for NoSpaces {
        fn name(&self) -> &str {
            "no-spaces"
        }

        async fn validate(&self, file: &FileRef, _header: &Bytes) -> CustomReport {
            if file.name.contains(' ') {
                CustomReport::reject("spaces are not allowed")
            } else {
                CustomReport::ok()
            }
        }
    }

    #[tokio::test]
    async fn test_custom_validator() {
        let validator = Validator::new(rules()).with_custom(Arc::new(NoSpaces));

        let err = validator
            .admit(&FileRef::from_bytes("my notes.txt", b"hi".to_vec()))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::Custom);
        assert_eq!(err.diagnostics[0].code, "no-spaces");

        assert!(validator.admit(&FileRef::from_bytes("notes.txt", b"hi".to_vec())).await.is_ok());
    }

    struct Counting(AtomicUsize);

    #[async_trait]
    impl CustomValidator for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn validate(&self, _file: &FileRef, _header: &Bytes) -> CustomReport {
            self.0.fetch_add(1, Ordering::SeqCst);
            CustomReport::ok()
        }
    }

    #[tokio::test]
    async fn test_results_are_cached() {
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        let validator = Validator::new(rules()).with_custom(counter.clone());
        let file = FileRef::from_bytes("notes.txt", b"hi".to_vec());

        validator.validate(&file).await;
        validator.validate(&file).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert_eq!(validator.cached_len(), 1);

        validator.clear_cache();
        validator.validate(&file).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_distinguishes_same_named_buffers() {
        let validator = Validator::new(rules());
        let header = png_header();
        let mut forged = vec![0u8; header.len()];
        forged[..5].copy_from_slice(b"%PDF-");

        let real = FileRef::from_bytes("photo.png", header);
        let fake = FileRef::from_bytes("photo.png", forged);
        assert_eq!(real.size, fake.size);

        assert!(validator.validate(&real).await.accepted);
        let err = validator.admit(&fake).await.unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::ContentMismatch);
        assert_eq!(validator.cached_len(), 2);
    }
}

use serde::Serialize;

/// 扩展名 -> MIME 类型
const EXTENSION_TABLE: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("avi", "video/x-msvideo"),
    ("mkv", "video/x-matroska"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("flac", "audio/flac"),
    ("m4a", "audio/mp4"),
    ("pdf", "application/pdf"),
    ("doc", "application/msword"),
    ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
    ("xls", "application/vnd.ms-excel"),
    ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
    ("ppt", "application/vnd.ms-powerpoint"),
    ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
    ("odt", "application/vnd.oasis.opendocument.text"),
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("tar", "application/x-tar"),
    ("7z", "application/x-7z-compressed"),
    ("rar", "application/vnd.rar"),
    ("exe", "application/x-msdownload"),
    ("dll", "application/x-msdownload"),
    ("msi", "application/x-msi"),
    ("sh", "application/x-sh"),
    ("bat", "application/x-bat"),
    ("js", "text/javascript"),
];

/// 可执行或脚本类扩展名
pub(crate) const EXECUTABLE_EXTENSIONS: &[&str] = &[
    "exe", "dll", "com", "scr", "pif", "bat", "cmd", "msi", "vbs", "vbe", "js", "jse",
    "wsf", "wsh", "ps1", "hta", "cpl", "lnk", "jar", "sh", "app", "apk",
];

/// 按扩展名查 MIME 类型，扩展名需为小写
pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    EXTENSION_TABLE
        .iter()
        .find(|(ext, _)| *ext == extension)
        .map(|(_, mime)| *mime)
}

/// 文件大类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Executable,
    Other,
}

impl FileCategory {
    pub fn from_mime(mime: &str) -> Self {
        let mime = normalize_mime(mime);
        match mime.split('/').next().unwrap_or_default() {
            "image" => return FileCategory::Image,
            "video" => return FileCategory::Video,
            "audio" => return FileCategory::Audio,
            "text" => return FileCategory::Document,
            _ => {}
        }

        match mime.as_str() {
            "application/zip" | "application/gzip" | "application/x-tar"
            | "application/x-7z-compressed" | "application/vnd.rar" => FileCategory::Archive,
            "application/x-msdownload" | "application/x-msi" | "application/x-sh"
            | "application/x-bat" | "application/x-executable" | "application/x-mach-binary" => {
                FileCategory::Executable
            }
            "application/pdf" | "application/json" | "application/xml" | "application/msword"
            | "application/vnd.ms-excel" | "application/vnd.ms-powerpoint" => FileCategory::Document,
            other if other.starts_with("application/vnd.openxmlformats-officedocument")
                || other.starts_with("application/vnd.oasis.opendocument") =>
            {
                FileCategory::Document
            }
            _ => FileCategory::Other,
        }
    }
}

/// 小写并去掉参数部分（`text/plain; charset=utf-8` -> `text/plain`）
pub fn normalize_mime(mime: &str) -> String {
    let mime = mime.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    match mime.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "audio/x-wav" | "audio/wave" => "audio/wav".to_string(),
        "application/x-zip-compressed" => "application/zip".to_string(),
        _ => mime,
    }
}

/// MIME 类型是否匹配允许列表，支持 `*/*` 与 `image/*`
pub fn mime_allowed(mime: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let mime = normalize_mime(mime);
    allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*/*" || pattern == "*" {
            return true;
        }
        match pattern.strip_suffix("/*") {
            Some(prefix) => mime.split('/').next() == Some(prefix),
            None => normalize_mime(&pattern) == mime,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_lookup() {
        assert_eq!(mime_for_extension("png"), Some("image/png"));
        assert_eq!(mime_for_extension("jpeg"), Some("image/jpeg"));
        assert_eq!(mime_for_extension("unknown"), None);
    }

    #[test]
    fn test_allowed_patterns() {
        let allowed = vec!["image/*".to_string(), "application/pdf".to_string()];
        assert!(mime_allowed("image/png", &allowed));
        assert!(mime_allowed("IMAGE/JPG", &allowed));
        assert!(mime_allowed("application/pdf", &allowed));
        assert!(!mime_allowed("video/mp4", &allowed));

        assert!(mime_allowed("anything/else", &["*/*".to_string()]));
        assert!(mime_allowed("video/mp4", &[]));
    }

    #[test]
    fn test_categories() {
        assert_eq!(FileCategory::from_mime("image/png"), FileCategory::Image);
        assert_eq!(FileCategory::from_mime("text/csv; charset=utf-8"), FileCategory::Document);
        assert_eq!(FileCategory::from_mime("application/zip"), FileCategory::Archive);
        assert_eq!(FileCategory::from_mime("application/x-msdownload"), FileCategory::Executable);
        assert_eq!(
            FileCategory::from_mime("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
            FileCategory::Document
        );
        assert_eq!(FileCategory::from_mime("application/octet-stream"), FileCategory::Other);
    }
}

use crate::core::ValidationErrorKind;
use super::types::EXECUTABLE_EXTENSIONS;
use super::Diagnostic;

/// 文件名最大字节数
pub const MAX_FILENAME_LEN: usize = 255;

/// Windows 保留设备名
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL",
    "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9",
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// 双向文本控制字符，可以把 `gpj.exe` 显示成 `exe.jpg`
const BIDI_OVERRIDES: &[char] = &[
    '\u{202A}', '\u{202B}', '\u{202C}', '\u{202D}', '\u{202E}',
    '\u{2066}', '\u{2067}', '\u{2068}', '\u{2069}',
];

pub(crate) fn check_filename(name: &str, reject_reserved: bool, errors: &mut Vec<Diagnostic>, warnings: &mut Vec<Diagnostic>) {
    if name.trim().is_empty() {
        errors.push(Diagnostic::new(ValidationErrorKind::InvalidFilename, "empty-filename", "filename is empty"));
        return;
    }

    if name.len() > MAX_FILENAME_LEN {
        errors.push(Diagnostic::new(
            ValidationErrorKind::InvalidFilename,
            "filename-too-long",
            format!("filename is {} bytes, limit is {MAX_FILENAME_LEN}", name.len()),
        ));
    }

    if name.chars().any(char::is_control) {
        errors.push(Diagnostic::new(
            ValidationErrorKind::InvalidFilename,
            "control-characters",
            "filename contains control characters",
        ));
    }

    if name.contains(['/', '\\']) {
        errors.push(Diagnostic::new(
            ValidationErrorKind::InvalidFilename,
            "path-separator",
            "filename contains a path separator",
        ));
    }

    if name == "." || name == ".." {
        errors.push(Diagnostic::new(ValidationErrorKind::InvalidFilename, "dot-name", "filename is a directory reference"));
    }

    if reject_reserved && is_reserved_name(name) {
        errors.push(Diagnostic::new(
            ValidationErrorKind::InvalidFilename,
            "reserved-name",
            format!("{name} is a reserved device name"),
        ));
    }

    if name.ends_with(['.', ' ']) {
        warnings.push(Diagnostic::new(
            ValidationErrorKind::InvalidFilename,
            "trailing-dot-or-space",
            "filename ends with a dot or space",
        ));
    }

    if name.contains(BIDI_OVERRIDES) {
        errors.push(Diagnostic::new(
            ValidationErrorKind::SecurityFlagged,
            "bidi-override",
            "filename contains bidirectional override characters",
        ));
    }
}

/// 可执行扩展名与伪装的双扩展名（`invoice.pdf.exe`）
pub(crate) fn check_executable_name(name: &str, errors: &mut Vec<Diagnostic>) {
    let lower = name.to_ascii_lowercase();
    let parts: Vec<&str> = lower.split('.').collect();
    if parts.len() < 2 {
        return;
    }

    let last = parts[parts.len() - 1];
    if !EXECUTABLE_EXTENSIONS.contains(&last) {
        return;
    }

    let disguised = parts.len() > 2 && super::mime_for_extension(parts[parts.len() - 2]).is_some();
    let message = if disguised {
        format!("executable .{last} file disguised with a double extension")
    } else {
        format!("executable .{last} files are not accepted")
    };
    errors.push(Diagnostic::new(ValidationErrorKind::SecurityFlagged, "executable", message));
}

fn is_reserved_name(name: &str) -> bool {
    let stem = name.split('.').next().unwrap_or_default().trim_end();
    RESERVED_NAMES.iter().any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(name: &str) -> (Vec<Diagnostic>, Vec<Diagnostic>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        check_filename(name, true, &mut errors, &mut warnings);
        (errors, warnings)
    }

    fn codes(diagnostics: &[Diagnostic]) -> Vec<&str> {
        diagnostics.iter().map(|d| d.code.as_str()).collect()
    }

    #[test]
    fn test_valid_names() {
        for name in ["photo.jpg", "report final (2).pdf", "数据.csv", ".env"] {
            let (errors, warnings) = check(name);
            assert!(errors.is_empty(), "{name}: {errors:?}");
            assert!(warnings.is_empty(), "{name}: {warnings:?}");
        }
    }

    #[test]
    fn test_rejected_names() {
        assert_eq!(codes(&check("").0), vec!["empty-filename"]);
        assert_eq!(codes(&check("bad\u{0007}name.txt").0), vec!["control-characters"]);
        assert_eq!(codes(&check("../etc/passwd").0), vec!["path-separator"]);
        assert_eq!(codes(&check(&"a".repeat(256)).0), vec!["filename-too-long"]);
        assert_eq!(codes(&check("CON").0), vec!["reserved-name"]);
        assert_eq!(codes(&check("lpt1.txt").0), vec!["reserved-name"]);
        assert_eq!(codes(&check("photo\u{202E}gpj.exe").0), vec!["bidi-override"]);
    }

    #[test]
    fn test_reserved_names_can_be_allowed() {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        check_filename("aux.log", false, &mut errors, &mut warnings);
        assert!(errors.is_empty());
    }

    #[test]
    fn test_trailing_dot_is_warning() {
        let (errors, warnings) = check("notes.txt.");
        assert!(errors.is_empty());
        assert_eq!(codes(&warnings), vec!["trailing-dot-or-space"]);
    }

    #[test]
    fn test_executable_names() {
        let mut errors = Vec::new();
        check_executable_name("setup.exe", &mut errors);
        check_executable_name("invoice.pdf.exe", &mut errors);
        check_executable_name("photo.jpg", &mut errors);
        check_executable_name("Makefile", &mut errors);

        assert_eq!(errors.len(), 2);
        assert!(errors[1].message.contains("double extension"));
    }
}

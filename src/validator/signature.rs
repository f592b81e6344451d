//! 文件头魔数识别

/// 已知的文件签名
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    /// 识别出的 MIME 类型
    pub mime: &'static str,
    /// 同一签名可对应多个 MIME 类型（如 docx 与 zip）
    pub family: &'static str,
    /// 签名足够长，不易误判
    pub strong: bool,
    pub executable: bool,
}

struct Magic {
    offset: usize,
    bytes: &'static [u8],
}

const fn at(offset: usize, bytes: &'static [u8]) -> Magic {
    Magic { offset, bytes }
}

struct Rule {
    signature: Signature,
    magics: &'static [Magic],
}

const fn sig(mime: &'static str, family: &'static str, strong: bool, executable: bool) -> Signature {
    Signature { mime, family, strong, executable }
}

/// 按顺序匹配，靠前的规则优先（RIFF 子类型在前）
const RULES: &[Rule] = &[
    Rule { signature: sig("image/png", "png", true, false), magics: &[at(0, b"\x89PNG\r\n\x1a\n")] },
    Rule { signature: sig("image/jpeg", "jpeg", true, false), magics: &[at(0, b"\xFF\xD8\xFF")] },
    Rule { signature: sig("image/gif", "gif", true, false), magics: &[at(0, b"GIF87a")] },
    Rule { signature: sig("image/gif", "gif", true, false), magics: &[at(0, b"GIF89a")] },
    Rule { signature: sig("image/webp", "webp", true, false), magics: &[at(0, b"RIFF"), at(8, b"WEBP")] },
    Rule { signature: sig("audio/wav", "wav", true, false), magics: &[at(0, b"RIFF"), at(8, b"WAVE")] },
    Rule { signature: sig("video/x-msvideo", "avi", true, false), magics: &[at(0, b"RIFF"), at(8, b"AVI ")] },
    Rule { signature: sig("image/tiff", "tiff", true, false), magics: &[at(0, b"II*\x00")] },
    Rule { signature: sig("image/tiff", "tiff", true, false), magics: &[at(0, b"MM\x00*")] },
    Rule { signature: sig("image/bmp", "bmp", false, false), magics: &[at(0, b"BM")] },
    Rule { signature: sig("application/pdf", "pdf", true, false), magics: &[at(0, b"%PDF-")] },
    Rule { signature: sig("application/zip", "zip", true, false), magics: &[at(0, b"PK\x03\x04")] },
    Rule { signature: sig("application/zip", "zip", true, false), magics: &[at(0, b"PK\x05\x06")] },
    Rule { signature: sig("application/gzip", "gzip", false, false), magics: &[at(0, b"\x1F\x8B")] },
    Rule { signature: sig("application/x-7z-compressed", "7z", true, false), magics: &[at(0, b"7z\xBC\xAF\x27\x1C")] },
    Rule { signature: sig("application/vnd.rar", "rar", true, false), magics: &[at(0, b"Rar!\x1A\x07")] },
    Rule { signature: sig("application/x-ole-storage", "ole", true, false), magics: &[at(0, b"\xD0\xCF\x11\xE0\xA1\xB1\x1A\xE1")] },
    Rule { signature: sig("video/mp4", "isobmff", true, false), magics: &[at(4, b"ftyp")] },
    Rule { signature: sig("video/x-matroska", "matroska", true, false), magics: &[at(0, b"\x1A\x45\xDF\xA3")] },
    Rule { signature: sig("audio/ogg", "ogg", true, false), magics: &[at(0, b"OggS")] },
    Rule { signature: sig("audio/flac", "flac", true, false), magics: &[at(0, b"fLaC")] },
    Rule { signature: sig("audio/mpeg", "mpeg", true, false), magics: &[at(0, b"ID3")] },
    Rule { signature: sig("application/x-msdownload", "pe", false, true), magics: &[at(0, b"MZ")] },
    Rule { signature: sig("application/x-executable", "elf", true, true), magics: &[at(0, b"\x7FELF")] },
    Rule { signature: sig("application/x-mach-binary", "macho", true, true), magics: &[at(0, b"\xCF\xFA\xED\xFE")] },
    Rule { signature: sig("application/x-mach-binary", "macho", true, true), magics: &[at(0, b"\xFE\xED\xFA\xCE")] },
    Rule { signature: sig("application/x-sh", "script", false, true), magics: &[at(0, b"#!")] },
];

/// 声明的 MIME 类型 -> 期望的签名族
const DECLARED_FAMILIES: &[(&str, &str)] = &[
    ("image/png", "png"),
    ("image/jpeg", "jpeg"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
    ("image/bmp", "bmp"),
    ("image/tiff", "tiff"),
    ("audio/wav", "wav"),
    ("video/x-msvideo", "avi"),
    ("application/pdf", "pdf"),
    ("application/zip", "zip"),
    ("application/java-archive", "zip"),
    ("application/epub+zip", "zip"),
    ("application/vnd.openxmlformats-officedocument.wordprocessingml.document", "zip"),
    ("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet", "zip"),
    ("application/vnd.openxmlformats-officedocument.presentationml.presentation", "zip"),
    ("application/vnd.oasis.opendocument.text", "zip"),
    ("application/gzip", "gzip"),
    ("application/x-7z-compressed", "7z"),
    ("application/vnd.rar", "rar"),
    ("application/msword", "ole"),
    ("application/vnd.ms-excel", "ole"),
    ("application/vnd.ms-powerpoint", "ole"),
    ("application/x-msi", "ole"),
    ("video/mp4", "isobmff"),
    ("video/quicktime", "isobmff"),
    ("audio/mp4", "isobmff"),
    ("video/webm", "matroska"),
    ("video/x-matroska", "matroska"),
    ("audio/ogg", "ogg"),
    ("audio/flac", "flac"),
    ("application/x-msdownload", "pe"),
    ("application/x-executable", "elf"),
    ("application/x-mach-binary", "macho"),
];

/// 识别文件头
pub fn detect(header: &[u8]) -> Option<Signature> {
    RULES
        .iter()
        .find(|rule| {
            rule.magics.iter().all(|magic| {
                header
                    .get(magic.offset..magic.offset + magic.bytes.len())
                    .is_some_and(|slice| slice == magic.bytes)
            })
        })
        .map(|rule| rule.signature)
}

/// 声明类型所属的签名族，没有可识别签名的类型（如纯文本）返回 `None`
pub fn declared_family(mime: &str) -> Option<&'static str> {
    DECLARED_FAMILIES
        .iter()
        .find(|(declared, _)| *declared == mime)
        .map(|(_, family)| *family)
}

/// 从 PNG / GIF / BMP 头部读取宽高
pub fn dimensions(header: &[u8]) -> Option<(u32, u32)> {
    let signature = detect(header)?;
    match signature.family {
        "png" => {
            if header.get(12..16)? != b"IHDR" {
                return None;
            }
            let width = u32::from_be_bytes(header.get(16..20)?.try_into().ok()?);
            let height = u32::from_be_bytes(header.get(20..24)?.try_into().ok()?);
            Some((width, height))
        }
        "gif" => {
            let width = u16::from_le_bytes(header.get(6..8)?.try_into().ok()?);
            let height = u16::from_le_bytes(header.get(8..10)?.try_into().ok()?);
            Some((width as u32, height as u32))
        }
        "bmp" => {
            let width = i32::from_le_bytes(header.get(18..22)?.try_into().ok()?);
            let height = i32::from_le_bytes(header.get(22..26)?.try_into().ok()?);
            Some((width.unsigned_abs(), height.unsigned_abs()))
        }
        _ => None,
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_common_formats() {
        assert_eq!(detect(&fixtures::png_header()).unwrap().mime, "image/png");
        assert_eq!(detect(b"\xFF\xD8\xFF\xE0rest").unwrap().mime, "image/jpeg");
        assert_eq!(detect(b"%PDF-1.7\n").unwrap().mime, "application/pdf");
        assert_eq!(detect(b"RIFF\x00\x00\x00\x00WEBPVP8 ").unwrap().mime, "image/webp");
        assert_eq!(detect(b"RIFF\x00\x00\x00\x00WAVEfmt ").unwrap().mime, "audio/wav");
        assert_eq!(detect(b"\x00\x00\x00\x18ftypmp42").unwrap().family, "isobmff");
        assert!(detect(b"just some text").is_none());
        assert!(detect(b"").is_none());
    }

    #[test]
    fn test_executables_are_marked() {
        assert!(detect(b"MZ\x90\x00").unwrap().executable);
        assert!(detect(b"\x7FELF\x02\x01").unwrap().executable);
        assert!(detect(b"#!/bin/sh\n").unwrap().executable);
        assert!(!detect(b"PK\x03\x04").unwrap().executable);
    }

    #[test]
    fn test_declared_family_groups_zip_documents() {
        assert_eq!(
            declared_family("application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
            Some("zip")
        );
        assert_eq!(declared_family("text/plain"), None);
    }

    #[test]
    fn test_dimensions() {
        assert_eq!(dimensions(&fixtures::png_header()), Some((640, 480)));

        let gif = b"GIF89a\x20\x03\x58\x02\x00\x00";
        assert_eq!(dimensions(gif), Some((800, 600)));

        assert_eq!(dimensions(b"%PDF-1.4"), None);
    }
}

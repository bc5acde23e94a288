//! Local file naming for downloaded resources.
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

static UNSAFE_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("static regex"));

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize(name: &str) -> String {
    UNSAFE_CHARS.replace_all(name, "_").into_owned()
}

/// Extension carried by the display name, if it has a usable one.
pub fn name_extension(display_name: &str) -> Option<&str> {
    Path::new(display_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
}

/// Extension for a MIME type, ignoring parameters and case.
pub fn mime_extension(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    let ext = match essence.as_str() {
        "application/pdf" => "pdf",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => "pptx",
        "application/vnd.ms-powerpoint" => "ppt",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/vnd.ms-excel" => "xls",
        "application/zip" => "zip",
        "text/plain" => "txt",
        "text/markdown" => "md",
        "text/csv" => "csv",
        "text/html" => "html",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "audio/mpeg" => "mp3",
        _ => return None,
    };
    Some(ext)
}

/// `<resourceId>_<sanitizedName>[.ext]`. The extension is appended only when the
/// display name does not already carry one and the content type maps to one.
pub fn file_name(resource_id: i64, display_name: &str, content_type: Option<&str>) -> String {
    let mut base = sanitize(display_name);
    if base.is_empty() {
        base.push_str("resource");
    }
    let suffix = if name_extension(display_name).is_some() {
        None
    } else {
        content_type.and_then(mime_extension)
    };
    match suffix {
        Some(ext) => format!("{}_{}.{}", resource_id, base, ext),
        None => format!("{}_{}", resource_id, base),
    }
}

pub fn destination(
    storage_dir: &Path,
    resource_id: i64,
    display_name: &str,
    content_type: Option<&str>,
) -> PathBuf {
    storage_dir.join(file_name(resource_id, display_name, content_type))
}

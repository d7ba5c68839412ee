// src/mime.rs

pub const DEFAULT_MIME: &str = "application/octet-stream";
pub const HTML_MIME: &str = "text/html";

const SUFFIX_TYPES: &[(&str, &str)] = &[
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xml", "text/xml"),
    ("xhtml", "application/xhtml+xml"),
    ("txt", "text/plain"),
    ("rtf", "application/rtf"),
    ("pdf", "application/pdf"),
    ("word", "application/msword"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("ico", "image/x-icon"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("svg", "image/svg+xml"),
    ("au", "audio/basic"),
    ("mpeg", "video/mpeg"),
    ("mpg", "video/mpeg"),
    ("mp4", "video/mp4"),
    ("mpg4", "video/mp4"),
    ("avi", "video/x-msvideo"),
    ("gz", "application/x-gzip"),
    ("tar", "application/x-tar"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
];

/// MIME type for `path`, by the suffix after the last `.` of its last
/// segment. Case-insensitive; unknown or missing suffixes get `DEFAULT_MIME`.
pub fn from_path(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    let Some((_, ext)) = name.rsplit_once('.') else {
        return DEFAULT_MIME;
    };
    SUFFIX_TYPES
        .iter()
        .find(|(suffix, _)| suffix.eq_ignore_ascii_case(ext))
        .map(|(_, mime)| *mime)
        .unwrap_or(DEFAULT_MIME)
}

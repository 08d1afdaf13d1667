use bulkport_common::ResourcePath;
use url::Url;
use uuid::Uuid;

use super::{Result, TransferError};
use crate::config::TransferConfig;

const MAX_FILE_NAME_LEN: usize = 128;

/// Scheme and extension allow-lists applied before any side effect
#[derive(Debug, Clone)]
pub struct UrlPolicy {
    allowed_schemes: Vec<String>,
    /// Lower-case, without the leading dot; empty allows any extension
    allowed_extensions: Vec<String>,
}

/// A URL that passed [`UrlPolicy::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    pub file_name: String,
    pub extension: Option<String>,
}

impl UrlPolicy {
    pub fn new(allowed_schemes: Vec<String>, allowed_extensions: Vec<String>) -> Self {
        Self {
            allowed_schemes,
            allowed_extensions,
        }
    }

    pub fn from_config(config: &TransferConfig) -> Self {
        Self::new(
            config.allowed_schemes.clone(),
            config.allowed_extensions.clone(),
        )
    }

    pub fn validate(&self, raw: &str) -> Result<ValidatedUrl> {
        let url = Url::parse(raw.trim())
            .map_err(|e| TransferError::Validation(format!("'{}': {}", raw, e)))?;

        if !self.allowed_schemes.iter().any(|s| s == url.scheme()) {
            return Err(TransferError::Validation(format!(
                "scheme '{}' is not allowed",
                url.scheme()
            )));
        }

        match url.host_str() {
            Some(host) if !host.is_empty() => {},
            _ => {
                return Err(TransferError::Validation(format!(
                    "'{}' has no host",
                    raw
                )))
            },
        }

        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| "file".to_string());

        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty());

        if !self.allowed_extensions.is_empty() {
            match &extension {
                Some(ext) if self.allowed_extensions.contains(ext) => {},
                Some(ext) => {
                    return Err(TransferError::Validation(format!(
                        "extension '.{}' is not allowed",
                        ext
                    )))
                },
                None => {
                    return Err(TransferError::Validation(format!(
                        "'{}' has no file extension",
                        file_name
                    )))
                },
            }
        }

        Ok(ValidatedUrl {
            url,
            file_name,
            extension,
        })
    }
}

/// Keep `[A-Za-z0-9._-]`, replace everything else with `_`
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = cleaned.trim_start_matches('.');
    let mut out = if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    };

    if out.len() > MAX_FILE_NAME_LEN {
        // Keep the extension when truncating
        let ext = out
            .rsplit_once('.')
            .map(|(_, e)| format!(".{}", e))
            .filter(|e| e.len() < 16)
            .unwrap_or_default();
        out.truncate(MAX_FILE_NAME_LEN - ext.len());
        out.push_str(&ext);
    }
    out
}

/// Storage key for a transferred file: `{prefix}/{uuid}-{name}`
pub fn destination_key(prefix: &ResourcePath, file_name: &str) -> String {
    let name = format!("{}-{}", Uuid::new_v4().simple(), sanitize_file_name(file_name));
    if prefix.is_root() {
        name
    } else {
        format!("{}/{}", prefix.to_key(), name)
    }
}

/// MIME type from a `Content-Type` header, else from the extension
pub(crate) fn resolve_mime(content_type: Option<&str>, extension: Option<&str>) -> Option<String> {
    let declared = content_type
        .and_then(|ct| ct.parse::<mime::Mime>().ok())
        .filter(|m| *m != mime::APPLICATION_OCTET_STREAM)
        .map(|m| m.essence_str().to_string());

    declared.or_else(|| extension.and_then(mime_for_extension).map(str::to_string))
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "csv" => "text/csv",
        "txt" => "text/plain",
        "json" => "application/json",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => return None,
    };
    Some(mime)
}

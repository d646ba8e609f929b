//! Output file naming and the sink that persists exported files.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, TimeZone};
use regex::Regex;

use crate::retry::RetryPolicy;
use crate::{AppError, Result};

pub const TIMESTAMP_TOKEN: &str = "YYYYMMDD-HHmm";
pub const CHANNEL_TOKEN: &str = "{channel}";

#[allow(clippy::unwrap_used)] // literal pattern
static SLUG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9_-]+").unwrap());

/// Lowercase a channel name and collapse every run of other characters to one hyphen.
pub fn channel_slug(name: &str) -> String {
    let lower = name.to_lowercase();
    let slug = SLUG_RE.replace_all(&lower, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "channel".to_string()
    } else {
        slug.to_string()
    }
}

/// Expand `YYYYMMDD-HHmm` and `{channel}` in a file name format.
pub fn format_file_name<Tz: TimeZone>(format: &str, channel_name: &str, at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format
        .replace(TIMESTAMP_TOKEN, &at.format("%Y%m%d-%H%M").to_string())
        .replace(CHANNEL_TOKEN, &channel_slug(channel_name))
}

/// Companion HTML name: swap a trailing `.md`/`.markdown` for `.html`, or append it.
pub fn html_file_name(markdown_name: &str) -> String {
    let lower = markdown_name.to_ascii_lowercase();
    for ext in [".markdown", ".md"] {
        if lower.ends_with(ext) {
            let stem = &markdown_name[..markdown_name.len() - ext.len()];
            return format!("{}.html", stem);
        }
    }
    format!("{}.html", markdown_name)
}

/// Payload of a save request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveContent {
    Text(String),
    Bytes(Vec<u8>),
    /// `data:<mime>;base64,<payload>`
    DataUrl(String),
}

impl SaveContent {
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            SaveContent::Text(text) => Ok(text.into_bytes()),
            SaveContent::Bytes(bytes) => Ok(bytes),
            SaveContent::DataUrl(url) => decode_data_url(&url),
        }
    }
}

pub fn encode_data_url(bytes: &[u8], mime_type: &str) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(bytes))
}

pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let rest = url
        .strip_prefix("data:")
        .ok_or_else(|| AppError::Download("not a data URL".into()))?;
    let (meta, payload) = rest
        .split_once(',')
        .ok_or_else(|| AppError::Download("malformed data URL".into()))?;
    if meta.ends_with(";base64") {
        STANDARD
            .decode(payload)
            .map_err(|e| AppError::Download(format!("invalid base64 payload: {}", e)))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRequest {
    pub filename: String,
    /// Subdirectory under the sink root; empty for the root itself.
    pub directory: String,
    pub content: SaveContent,
    pub mime_type: Option<String>,
}

impl SaveRequest {
    pub fn text(filename: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            directory: String::new(),
            content: SaveContent::Text(content.into()),
            mime_type: Some("text/markdown".to_string()),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn in_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Path of the saved file relative to the sink root, with `/` separators.
    pub fn relative_path(&self) -> String {
        let dir = self.directory.trim_matches('/');
        if dir.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", dir, self.filename)
        }
    }
}

/// Destination for exported documents and downloaded attachments.
#[async_trait]
pub trait FileSink: Send + Sync {
    /// Persist the request and return where it landed.
    async fn save(&self, request: SaveRequest) -> Result<PathBuf>;
}

/// Writes files below a root directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileSink {
    root: PathBuf,
}

impl LocalFileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_path(&self, request: &SaveRequest) -> Result<PathBuf> {
        let relative = Path::new(&request.directory).join(&request.filename);
        let filename_ok = Path::new(&request.filename).components().count() == 1;
        let all_normal = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if request.filename.is_empty() || !filename_ok || !all_normal {
            return Err(AppError::Validation(format!(
                "refusing to write outside the download directory: {}",
                request.relative_path()
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileSink for LocalFileSink {
    async fn save(&self, request: SaveRequest) -> Result<PathBuf> {
        let path = self.target_path(&request)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::WriteFile {
                    path: parent.display().to_string(),
                    source: e,
                })?;
        }

        let bytes = request.content.into_bytes()?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| AppError::WriteFile {
                path: path.display().to_string(),
                source: e,
            })?;

        tracing::debug!(path = %path.display(), bytes = bytes.len(), "saved file");
        Ok(path)
    }
}

/// Save with a bounded number of attempts and a fixed delay between them.
pub async fn save_with_retry(
    sink: &dyn FileSink,
    request: SaveRequest,
    policy: &RetryPolicy,
) -> Result<PathBuf> {
    let label = request.relative_path();
    policy
        .run(&label, |_| sink.save(request.clone()))
        .await
}

//! Attachment discovery, tiered downloading and reference rewriting.
//!
//! Each file is tried in order: a direct download (with the token only on
//! Slack hosts), a retry with a fresh URL from `files.info` when the first URL
//! looks stale, and finally a proxied fetch with a browser user agent whose
//! bytes are handed to the sink as a data URL. A file that fails every tier
//! keeps its remote URL in the exported document.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use regex::{Captures, Regex};
use reqwest::StatusCode;
use reqwest::redirect::Policy;

use crate::model::{FileRef, RawFile, RawMessage};
use crate::output::{FileSink, SaveContent, SaveRequest, channel_slug, encode_data_url, save_with_retry};
use crate::progress::{ProgressReporter, Stage};
use crate::retry::RetryPolicy;
use crate::settings::RateLimits;
use crate::slack::{FetchedFile, SlackClient};
use crate::{AppError, Result};

pub const ATTACHMENTS_DIR: &str = "attachments";

pub const PROXY_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Retries of the proxied fetch after its first attempt.
pub const PROXY_RETRIES: u32 = 2;

const MAX_REDIRECTS: usize = 10;
const MAX_BASE_LEN: usize = 80;
const DEFAULT_MIME: &str = "application/octet-stream";

/// Statuses that suggest the URL expired rather than the file being gone for good.
const STALE_STATUSES: &[StatusCode] = &[
    StatusCode::UNAUTHORIZED,
    StatusCode::FORBIDDEN,
    StatusCode::NOT_FOUND,
    StatusCode::GONE,
];

fn file_ref(file: &RawFile, embedded: bool) -> Option<FileRef> {
    let url = file.best_url()?.to_string();
    let mimetype = file
        .mimetype
        .clone()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| guess_mime(&url).to_string());
    let name = file
        .name
        .clone()
        .or_else(|| file.title.clone())
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| base_name_from_url(&url));
    Some(FileRef {
        id: file.id.clone(),
        image: mimetype.starts_with("image/"),
        name,
        url,
        mimetype,
        embedded,
    })
}

fn base_name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "file".to_string())
}

fn guess_mime(name: &str) -> &'static str {
    let path = name.split(['?', '#']).next().unwrap_or(name);
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain",
        _ => DEFAULT_MIME,
    }
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => ".png",
        "image/jpeg" => ".jpg",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "application/pdf" => ".pdf",
        "text/plain" => ".txt",
        _ => "",
    }
}

/// Every file a message references: the `files` array, the single `file`
/// share field and image blocks nested anywhere in `blocks`.
pub fn collect_files(message: &RawMessage) -> Vec<FileRef> {
    let mut files: Vec<FileRef> = message
        .files
        .iter()
        .filter_map(|f| file_ref(f, false))
        .collect();

    if let Some(file) = &message.file
        && let Some(file) = file_ref(file, false)
    {
        files.push(file);
    }

    for block in &message.blocks {
        collect_image_blocks(block, &mut files);
    }
    files
}

fn collect_image_blocks(value: &serde_json::Value, files: &mut Vec<FileRef>) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("type").and_then(|t| t.as_str()) == Some("image") {
                let slack_file = map.get("slack_file");
                let url = map
                    .get("image_url")
                    .or_else(|| slack_file.and_then(|f| f.get("url")))
                    .and_then(|u| u.as_str())
                    .filter(|u| !u.is_empty());
                if let Some(url) = url {
                    let id = slack_file
                        .and_then(|f| f.get("id"))
                        .and_then(|i| i.as_str())
                        .unwrap_or_default();
                    let name = map
                        .get("alt_text")
                        .and_then(|a| a.as_str())
                        .filter(|a| !a.trim().is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| base_name_from_url(url));
                    let mimetype = match guess_mime(url) {
                        DEFAULT_MIME => "image/png",
                        known => known,
                    };
                    files.push(FileRef {
                        id: id.to_string(),
                        name,
                        url: url.to_string(),
                        mimetype: mimetype.to_string(),
                        image: true,
                        embedded: true,
                    });
                }
            }
            for child in map.values() {
                if child.is_array() || child.is_object() {
                    collect_image_blocks(child, files);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_image_blocks(item, files);
            }
        }
        _ => {}
    }
}

/// `<run_id>-<0001>-<base><ext>`, safe for any filesystem.
pub fn attachment_file_name(run_id: &str, sequence: usize, file: &FileRef) -> String {
    let path = Path::new(&file.name);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 10 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_else(|| extension_for_mime(&file.mimetype).to_string());
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();

    let mut base = String::with_capacity(stem.len());
    for c in stem.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            base.push(c);
        } else if !base.ends_with('_') {
            base.push('_');
        }
    }
    let base: String = base.trim_matches('_').chars().take(MAX_BASE_LEN).collect();
    let base = if base.is_empty() { "file".to_string() } else { base };

    format!("{}-{:04}-{}{}", run_id, sequence, base, ext)
}

/// A short random token naming one export run.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(12).collect()
}

/// What became of one remote URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Saved; path relative to the download root.
    Local(String),
    Failed(String),
}

/// Remote URL -> resolution, for one channel export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadMap {
    entries: BTreeMap<String, Resolution>,
}

impl DownloadMap {
    pub fn insert(&mut self, url: impl Into<String>, resolution: Resolution) {
        self.entries.insert(url.into(), resolution);
    }

    pub fn get(&self, url: &str) -> Option<&Resolution> {
        self.entries.get(url)
    }

    pub fn local_path(&self, url: &str) -> Option<&str> {
        match self.entries.get(url) {
            Some(Resolution::Local(path)) => Some(path),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn downloaded(&self) -> usize {
        self.entries
            .values()
            .filter(|r| matches!(r, Resolution::Local(_)))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.downloaded()
    }

    /// Alternation over every known URL, longest first so a URL never
    /// matches as the prefix of a longer one.
    fn url_pattern(&self) -> Option<Result<Regex>> {
        if self.entries.is_empty() {
            return None;
        }
        let mut urls: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        urls.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        let alternation = urls
            .iter()
            .map(|url| regex::escape(url))
            .collect::<Vec<_>>()
            .join("|");
        Some(Regex::new(&alternation).map_err(|e| AppError::Validation(e.to_string())))
    }
}

/// Replace every occurrence of a downloaded URL in `content` with its local path.
///
/// Failed downloads are left untouched so the remote link still works.
pub fn rewrite_references(content: &str, downloads: &DownloadMap) -> String {
    let pattern = match downloads.url_pattern() {
        None => return content.to_string(),
        Some(Ok(pattern)) => pattern,
        Some(Err(e)) => {
            tracing::warn!(error = %e, "could not build attachment URL pattern");
            return content.to_string();
        }
    };

    pattern
        .replace_all(content, |caps: &Captures| {
            let url = &caps[0];
            downloads.local_path(url).unwrap_or(url).to_string()
        })
        .into_owned()
}

fn is_pdf(file: &FileRef) -> bool {
    file.mimetype == "application/pdf" || file.name.to_ascii_lowercase().ends_with(".pdf")
}

fn usable(fetched: &FetchedFile) -> bool {
    fetched.status.is_success() && !fetched.is_html() && !fetched.bytes.is_empty()
}

fn looks_stale(fetched: &FetchedFile) -> bool {
    STALE_STATUSES.contains(&fetched.status) || (fetched.status.is_success() && fetched.is_html())
}

pub struct AttachmentDownloader<'a> {
    client: &'a SlackClient,
    sink: &'a dyn FileSink,
    limits: &'a RateLimits,
    proxy: reqwest::Client,
}

impl<'a> AttachmentDownloader<'a> {
    pub fn new(client: &'a SlackClient, sink: &'a dyn FileSink, limits: &'a RateLimits) -> Result<Self> {
        let proxy = reqwest::Client::builder()
            .user_agent(PROXY_USER_AGENT)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AppError::Http(format!("failed to build download client: {}", e)))?;
        Ok(Self {
            client,
            sink,
            limits,
            proxy,
        })
    }

    fn write_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.limits.write_retries, self.limits.write_retry_delay())
    }

    /// Download every distinct URL in `files`, one at a time.
    pub async fn download_all(
        &self,
        files: &[FileRef],
        channel_name: &str,
        run_id: &str,
        reporter: &ProgressReporter<'_>,
    ) -> DownloadMap {
        let mut seen = HashSet::new();
        let unique: Vec<&FileRef> = files.iter().filter(|f| seen.insert(f.url.as_str())).collect();
        let directory = format!("{}/{}", ATTACHMENTS_DIR, channel_slug(channel_name));
        let mut downloads = DownloadMap::default();

        for (index, file) in unique.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.limits.file_delay()).await;
            }

            let filename = attachment_file_name(run_id, index + 1, file);
            let resolution = match self.download_one(file, &filename, &directory).await {
                Ok(path) => {
                    tracing::debug!(url = %file.url, path = %path, "attachment saved");
                    Resolution::Local(path)
                }
                Err(e) => {
                    tracing::warn!(name = %file.name, url = %file.url, error = %e, "attachment failed");
                    Resolution::Failed(e.to_string())
                }
            };
            downloads.insert(file.url.clone(), resolution);

            reporter
                .send(
                    reporter
                        .update(Stage::DownloadingAttachments)
                        .attachments(downloads.downloaded()),
                )
                .await;
        }

        downloads
    }

    /// Try each strategy in turn; returns the saved path relative to the sink root.
    pub async fn download_one(&self, file: &FileRef, filename: &str, directory: &str) -> Result<String> {
        let mut last_error = match self.direct(file, filename, directory).await {
            Ok(path) => return Ok(path),
            Err(e) => e,
        };

        let mut url = file.url.clone();
        for attempt in 0..=PROXY_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(self.limits.retry_base_delay()).await;
                if let Some(fresh) = self.fresh_url(file).await {
                    url = fresh;
                }
            }
            match self.fetch_proxied(&url).await {
                Ok(fetched) => {
                    let data_url = encode_data_url(&fetched.bytes, &file.mimetype);
                    let request = SaveRequest {
                        filename: filename.to_string(),
                        directory: directory.to_string(),
                        content: SaveContent::DataUrl(data_url),
                        mime_type: Some(file.mimetype.clone()),
                    };
                    return self.save(request).await;
                }
                Err(e) => last_error = e,
            }
        }

        Err(AppError::Download(format!("{}: {}", file.name, last_error)))
    }

    async fn direct(&self, file: &FileRef, filename: &str, directory: &str) -> Result<String> {
        let fetched = self.client.fetch_file(&file.url).await?;
        if usable(&fetched) {
            return self.save_bytes(file, filename, directory, fetched.bytes).await;
        }

        let stale = looks_stale(&fetched);
        if !(is_pdf(file) || stale) {
            return Err(AppError::Download(format!("HTTP {}", fetched.status)));
        }

        let Some(fresh) = self.fresh_url(file).await else {
            return Err(AppError::Download(format!(
                "HTTP {} and no fresh URL available",
                fetched.status
            )));
        };
        let refetched = self.client.fetch_file(&fresh).await?;
        if usable(&refetched) {
            return self.save_bytes(file, filename, directory, refetched.bytes).await;
        }
        Err(AppError::Download(format!(
            "HTTP {} after refreshing URL",
            refetched.status
        )))
    }

    async fn fresh_url(&self, file: &FileRef) -> Option<String> {
        if file.id.is_empty() {
            return None;
        }
        match self.client.files_info(&file.id).await {
            Ok(info) => info.best_url().map(str::to_string),
            Err(e) => {
                tracing::debug!(file_id = %file.id, error = %e, "files.info lookup failed");
                None
            }
        }
    }

    async fn fetch_proxied(&self, url: &str) -> Result<FetchedFile> {
        let fetched = self.client.fetch_file_via(&self.proxy, url).await?;
        if usable(&fetched) {
            Ok(fetched)
        } else {
            Err(AppError::Download(format!("proxied fetch returned HTTP {}", fetched.status)))
        }
    }

    async fn save_bytes(&self, file: &FileRef, filename: &str, directory: &str, bytes: Vec<u8>) -> Result<String> {
        let request = SaveRequest {
            filename: filename.to_string(),
            directory: directory.to_string(),
            content: SaveContent::Bytes(bytes),
            mime_type: Some(file.mimetype.clone()),
        };
        self.save(request).await
    }

    async fn save(&self, request: SaveRequest) -> Result<String> {
        let relative = request.relative_path();
        save_with_retry(self.sink, request, &self.write_policy()).await?;
        Ok(relative)
    }
}

//! Per-channel export pipeline.
//!
//! `fetching_messages -> fetching_thread_replies -> enriching_messages ->
//! downloading_attachments -> building_markdown -> done`, with `error`
//! reachable from every step. The pipeline never returns an error: failures
//! become a response with `success: false` and a minimal document.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::attachments::{self, AttachmentDownloader, DownloadMap, rewrite_references};
use crate::channel::validate_channel_id;
use crate::history::HistoryFetcher;
use crate::markdown::{RenderOptions, to_markdown};
use crate::md_to_html::save_html_companion;
use crate::model::{
    EnrichedMessage, FileRef, RawMessage, UNKNOWN_USER, UserMap, sort_by_timestamp,
};
use crate::mrkdwn::{self, MrkdwnOptions};
use crate::output::{FileSink, SaveRequest, format_file_name, save_with_retry};
use crate::progress::{ProgressObserver, ProgressReporter, Stage};
use crate::retry::RetryPolicy;
use crate::settings::{ExportSettings, RateLimits, Settings};
use crate::slack::SlackClient;
use crate::text::clean;
use crate::users::IdentityResolver;
use crate::{AppError, Result};

/// Membership noise dropped before rendering.
pub const JOIN_LEAVE_SUBTYPES: &[&str] = &[
    "channel_join",
    "channel_leave",
    "group_join",
    "group_leave",
];

const ENRICH_PROGRESS_EVERY: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelExportRequest {
    pub channel_id: String,
    pub channel_name: String,
    /// Export messages at or after this instant (epoch milliseconds); 0 for everything.
    pub oldest_timestamp_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelExportResponse {
    pub success: bool,
    pub message_count: usize,
    pub attachment_count: usize,
    pub markdown: String,
    /// The pipeline already wrote the document itself.
    pub markdown_saved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Exports one channel. Implementations report failure in the response instead of erroring.
#[async_trait]
pub trait ChannelExport: Send + Sync {
    async fn export_channel(&self, request: ChannelExportRequest) -> ChannelExportResponse;
}

/// Minimal document written in place of a failed export.
pub fn error_document(channel_name: &str, error: &str) -> String {
    format!(
        "# {}\n\nExported: {}\n\n---\n\n_Export failed: {}_\n",
        channel_name,
        Local::now().format("%b %-d, %Y %-I:%M %p"),
        error.replace('\n', " ")
    )
}

fn sender_name(raw: &RawMessage, users: &UserMap) -> String {
    if let Some(user) = raw.user.as_deref().filter(|u| !u.is_empty()) {
        return users
            .get(user)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_USER.to_string());
    }
    raw.username
        .as_deref()
        .or_else(|| raw.bot_profile.as_ref().and_then(|b| b.name.as_deref()))
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(UNKNOWN_USER)
        .to_string()
}

/// `![name](url)` for images, `[name](url)` otherwise.
pub fn file_link(file: &FileRef) -> String {
    let name = file.name.replace('[', "(").replace(']', ")");
    if file.image {
        format!("![{}]({})", name, file.url)
    } else {
        format!("[{}]({})", name, file.url)
    }
}

pub fn is_join_or_leave(raw: &RawMessage) -> bool {
    raw.subtype
        .as_deref()
        .is_some_and(|s| JOIN_LEAVE_SUBTYPES.contains(&s))
}

/// Build the renderable form of a raw message, or `None` when nothing is left to show.
pub fn enrich_message(raw: &RawMessage, users: &UserMap, options: MrkdwnOptions) -> Option<EnrichedMessage> {
    if is_join_or_leave(raw) {
        return None;
    }

    let text = raw
        .text
        .as_deref()
        .map(|t| clean(&mrkdwn::to_markdown(t, users, options)))
        .unwrap_or_default();
    let files = attachments::collect_files(raw);

    let mut content = text;
    if !files.is_empty() {
        let links = files.iter().map(file_link).collect::<Vec<_>>().join("\n");
        if !content.is_empty() {
            content.push_str("\n\n");
        }
        content.push_str(&links);
    }

    if content.trim().is_empty() {
        return None;
    }

    Some(EnrichedMessage {
        sender: sender_name(raw, users),
        content,
        timestamp: raw.ts.clone(),
        thread_replies: Vec::new(),
        message_files: files,
    })
}

fn apply_downloads(message: &mut EnrichedMessage, downloads: &DownloadMap) {
    message.content = rewrite_references(&message.content, downloads);
    for file in &mut message.message_files {
        if let Some(path) = downloads.local_path(&file.url) {
            file.url = path.to_string();
        }
    }
    for reply in &mut message.thread_replies {
        apply_downloads(reply, downloads);
    }
}

/// The real pipeline: Slack web API in, Markdown and HTML files out.
pub struct ExportPipeline {
    client: SlackClient,
    sink: Arc<dyn FileSink>,
    observer: Arc<dyn ProgressObserver>,
    export: ExportSettings,
    limits: RateLimits,
}

impl ExportPipeline {
    pub fn new(
        client: SlackClient,
        sink: Arc<dyn FileSink>,
        observer: Arc<dyn ProgressObserver>,
        settings: &Settings,
    ) -> Self {
        Self {
            client,
            sink,
            observer,
            export: settings.export.clone(),
            limits: settings.rate_limits.clone(),
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            include_timestamps: self.export.include_timestamps,
            include_thread_replies: self.export.include_thread_replies,
        }
    }

    fn mrkdwn_options(&self) -> MrkdwnOptions {
        MrkdwnOptions {
            render_emoji: self.export.render_emoji,
        }
    }

    fn write_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.limits.write_retries, self.limits.write_retry_delay())
    }

    /// Write the Markdown document and, if enabled, its HTML companion.
    async fn save_documents(&self, channel_name: &str, markdown: &str) -> Result<PathBuf> {
        let filename = format_file_name(&self.export.file_name_format, channel_name, &Local::now());
        let policy = self.write_policy();

        let path = save_with_retry(
            self.sink.as_ref(),
            SaveRequest::text(&filename, markdown),
            &policy,
        )
        .await?;

        if self.export.write_html {
            save_html_companion(self.sink.as_ref(), &filename, markdown, &policy).await;
        }

        Ok(path)
    }
}

struct ExportOutcome {
    message_count: usize,
    attachment_count: usize,
    markdown: String,
}

/// State carried through one channel export.
struct ExportRun<'a> {
    pipeline: &'a ExportPipeline,
    request: &'a ChannelExportRequest,
    reporter: ProgressReporter<'a>,
    fetcher: HistoryFetcher<'a>,
    run_id: String,
    oldest: Option<i64>,
}

impl<'a> ExportRun<'a> {
    fn new(pipeline: &'a ExportPipeline, request: &'a ChannelExportRequest) -> Self {
        let oldest = (request.oldest_timestamp_ms > 0).then_some(request.oldest_timestamp_ms / 1000);
        Self {
            pipeline,
            request,
            reporter: ProgressReporter::new(pipeline.observer.as_ref(), &request.channel_id),
            fetcher: HistoryFetcher::new(&pipeline.client, &pipeline.limits),
            run_id: attachments::new_run_id(),
            oldest,
        }
    }

    fn include_threads(&self) -> bool {
        self.pipeline.export.include_thread_replies
    }

    async fn execute(&mut self) -> Result<ExportOutcome> {
        validate_channel_id(&self.request.channel_id)?;
        let channel_id = self.request.channel_id.as_str();

        self.reporter.stage(Stage::FetchingMessages).await;
        let history: Vec<RawMessage> = self
            .fetcher
            .fetch_history(channel_id, self.oldest)
            .await?
            .into_iter()
            .filter(|m| !is_join_or_leave(m))
            .collect();
        self.reporter
            .send(self.reporter.update(Stage::FetchingMessages).messages(history.len()))
            .await;

        let user_ids = self.fetch_threads_and_scan_users(&history).await;

        self.reporter.stage(Stage::EnrichingMessages).await;
        let users = IdentityResolver::new(&self.pipeline.client, &self.pipeline.limits)
            .resolve(&user_ids)
            .await;
        let mut messages = self.enrich(&history, &users).await;

        let downloads = self.download_attachments(&messages).await;
        for message in &mut messages {
            apply_downloads(message, &downloads);
        }

        self.reporter.stage(Stage::BuildingMarkdown).await;
        sort_by_timestamp(&mut messages);
        let markdown = to_markdown(&messages, &self.request.channel_name, &self.pipeline.render_options());

        Ok(ExportOutcome {
            message_count: messages.len(),
            attachment_count: downloads.downloaded(),
            markdown,
        })
    }

    /// Fetch every thread once and collect all user ids worth resolving.
    async fn fetch_threads_and_scan_users(&mut self, history: &[RawMessage]) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for message in history {
            mrkdwn::referenced_user_ids(message, &mut ids);
        }
        if !self.include_threads() {
            return ids;
        }

        let parents: Vec<&RawMessage> = history.iter().filter(|m| m.has_thread()).collect();
        let total = parents.len();
        self.reporter
            .send(self.reporter.update(Stage::FetchingThreadReplies).threads(0, total))
            .await;

        for (index, parent) in parents.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.pipeline.limits.thread_delay()).await;
            }
            let replies = self
                .fetcher
                .fetch_thread_replies(&self.request.channel_id, &parent.ts, self.oldest)
                .await;
            for reply in &replies {
                mrkdwn::referenced_user_ids(reply, &mut ids);
            }
            self.reporter
                .send(
                    self.reporter
                        .update(Stage::FetchingThreadReplies)
                        .threads(index + 1, total),
                )
                .await;
        }
        ids
    }

    async fn enrich(&mut self, history: &[RawMessage], users: &UserMap) -> Vec<EnrichedMessage> {
        let options = self.pipeline.mrkdwn_options();
        let mut messages = Vec::with_capacity(history.len());

        for (index, raw) in history.iter().enumerate() {
            let Some(mut message) = enrich_message(raw, users, options) else {
                continue;
            };

            if self.include_threads() && raw.has_thread() {
                let replies = self
                    .fetcher
                    .fetch_thread_replies(&self.request.channel_id, &raw.ts, self.oldest)
                    .await;
                let mut enriched: Vec<EnrichedMessage> = replies
                    .iter()
                    .filter_map(|r| enrich_message(r, users, options))
                    .collect();
                sort_by_timestamp(&mut enriched);
                message.thread_replies = enriched;
            }

            messages.push(message);

            if (index + 1) % ENRICH_PROGRESS_EVERY == 0 {
                self.reporter
                    .send(self.reporter.update(Stage::EnrichingMessages).messages(messages.len()))
                    .await;
            }
        }

        self.reporter
            .send(self.reporter.update(Stage::EnrichingMessages).messages(messages.len()))
            .await;
        messages
    }

    async fn download_attachments(&self, messages: &[EnrichedMessage]) -> DownloadMap {
        let files: Vec<FileRef> = messages
            .iter()
            .flat_map(|m| {
                m.message_files
                    .iter()
                    .chain(m.thread_replies.iter().flat_map(|r| r.message_files.iter()))
            })
            .cloned()
            .collect();

        self.reporter
            .send(self.reporter.update(Stage::DownloadingAttachments).attachments(0))
            .await;
        if files.is_empty() {
            return DownloadMap::default();
        }

        let downloader = match AttachmentDownloader::new(
            &self.pipeline.client,
            self.pipeline.sink.as_ref(),
            &self.pipeline.limits,
        ) {
            Ok(downloader) => downloader,
            Err(e) => {
                tracing::warn!(error = %e, "attachment downloads unavailable");
                return DownloadMap::default();
            }
        };
        downloader
            .download_all(&files, &self.request.channel_name, &self.run_id, &self.reporter)
            .await
    }
}

#[async_trait]
impl ChannelExport for ExportPipeline {
    async fn export_channel(&self, request: ChannelExportRequest) -> ChannelExportResponse {
        tracing::info!(
            channel = %request.channel_name,
            channel_id = %request.channel_id,
            oldest_ms = request.oldest_timestamp_ms,
            "exporting channel"
        );

        let mut run = ExportRun::new(self, &request);
        let reporter = run.reporter;

        let outcome = match run.execute().await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(channel = %request.channel_name, error = %e, "channel export failed");
                reporter.stage(Stage::Error).await;
                let markdown = error_document(&request.channel_name, &e.to_string());
                let markdown_saved = match self.save_documents(&request.channel_name, &markdown).await {
                    Ok(_) => true,
                    Err(save_err) => {
                        tracing::warn!(channel = %request.channel_name, error = %save_err, "could not save error document");
                        false
                    }
                };
                return ChannelExportResponse {
                    success: false,
                    markdown,
                    markdown_saved,
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        match self.save_documents(&request.channel_name, &outcome.markdown).await {
            Ok(path) => {
                tracing::info!(
                    channel = %request.channel_name,
                    messages = outcome.message_count,
                    attachments = outcome.attachment_count,
                    path = %path.display(),
                    "channel exported"
                );
                reporter
                    .send(
                        reporter
                            .update(Stage::Done)
                            .messages(outcome.message_count)
                            .attachments(outcome.attachment_count),
                    )
                    .await;
                ChannelExportResponse {
                    success: true,
                    message_count: outcome.message_count,
                    attachment_count: outcome.attachment_count,
                    markdown: outcome.markdown,
                    markdown_saved: true,
                    error: None,
                }
            }
            Err(e) => {
                let error = AppError::Download(format!("could not save document: {}", e));
                tracing::error!(channel = %request.channel_name, error = %error, "channel export failed");
                reporter.stage(Stage::Error).await;
                ChannelExportResponse {
                    success: false,
                    message_count: outcome.message_count,
                    attachment_count: outcome.attachment_count,
                    markdown: outcome.markdown,
                    markdown_saved: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

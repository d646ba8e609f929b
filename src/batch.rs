//! Sequential multi-channel export with durable progress.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local, TimeZone, Utc};

use crate::channel::{Channel, validate_channel_id};
use crate::export::{ChannelExport, ChannelExportRequest, ChannelExportResponse, error_document};
use crate::markdown::strip_header_block;
use crate::md_to_html::save_html_companion;
use crate::model::ExportResult;
use crate::output::{FileSink, SaveRequest, format_file_name, save_with_retry};
use crate::progress::{ProgressObserver, SessionEvent};
use crate::retry::RetryPolicy;
use crate::settings::{ExportSettings, RateLimits};
use crate::store::{KeyValueStore, record_last_export};
use crate::Result;

pub const COMBINED_TITLE: &str = "Slack Export";
const COMBINED_FILE_LABEL: &str = "combined";
const DAY_MS: i64 = 86_400_000;

/// Start of the export window: `now - history_days`.
pub fn oldest_timestamp_ms(now_ms: i64, history_days: u32) -> i64 {
    now_ms.saturating_sub(i64::from(history_days).saturating_mul(DAY_MS))
}

/// Join successful non-empty channel documents under one header.
pub fn combine_documents<Tz: TimeZone>(results: &[ExportResult], exported_at: &DateTime<Tz>) -> Option<String>
where
    Tz::Offset: std::fmt::Display,
{
    let sections: Vec<String> = results
        .iter()
        .filter(|r| r.success && r.message_count > 0 && !r.markdown.trim().is_empty())
        .map(|r| {
            format!(
                "## {}\n\n{}",
                r.channel_name,
                strip_header_block(&r.markdown).trim_end()
            )
        })
        .collect();

    if sections.is_empty() {
        return None;
    }

    Some(format!(
        "# {}\n\nExported: {}\n\nChannels: {}\n\n---\n\n{}\n",
        COMBINED_TITLE,
        exported_at.format("%b %-d, %Y %-I:%M %p"),
        sections.len(),
        sections.join("\n\n---\n\n")
    ))
}

#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub results: Vec<ExportResult>,
    pub combined_path: Option<PathBuf>,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ExportResult> {
        self.results.iter().filter(|r| !r.success)
    }

    pub fn total_messages(&self) -> usize {
        self.results.iter().map(|r| r.message_count).sum()
    }

    pub fn total_attachments(&self) -> usize {
        self.results.iter().map(|r| r.attachment_count).sum()
    }
}

/// Runs one channel at a time through a [`ChannelExport`].
pub struct BatchExporter {
    exporter: Arc<dyn ChannelExport>,
    observer: Arc<dyn ProgressObserver>,
    store: Arc<dyn KeyValueStore>,
    sink: Arc<dyn FileSink>,
    export: ExportSettings,
    limits: RateLimits,
}

impl BatchExporter {
    pub fn new(
        exporter: Arc<dyn ChannelExport>,
        observer: Arc<dyn ProgressObserver>,
        store: Arc<dyn KeyValueStore>,
        sink: Arc<dyn FileSink>,
        export: ExportSettings,
        limits: RateLimits,
    ) -> Self {
        Self {
            exporter,
            observer,
            store,
            sink,
            export,
            limits,
        }
    }

    fn write_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(self.limits.write_retries, self.limits.write_retry_delay())
    }

    pub async fn export_selected(&self, channels: &[Channel]) -> BatchSummary {
        self.export_selected_at(channels, Utc::now().timestamp_millis()).await
    }

    /// Export `channels` in order with the window anchored at `now_ms`.
    pub async fn export_selected_at(&self, channels: &[Channel], now_ms: i64) -> BatchSummary {
        let oldest = oldest_timestamp_ms(now_ms, self.export.history_days);
        tracing::info!(
            channels = channels.len(),
            history_days = self.export.history_days,
            oldest_ms = oldest,
            "starting batch export"
        );

        self.observer
            .session(SessionEvent::Start {
                channel_ids: channels.iter().map(|c| c.channel_id.clone()).collect(),
            })
            .await;

        let mut summary = BatchSummary::default();
        for (index, channel) in channels.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.limits.channel_delay()).await;
            }

            self.observer
                .session(SessionEvent::ChannelStart {
                    channel_id: channel.channel_id.clone(),
                    channel_name: channel.name.clone(),
                })
                .await;

            let result = self.export_one(channel, oldest, now_ms).await;

            self.observer
                .session(SessionEvent::ChannelDone {
                    channel_id: result.channel_id.clone(),
                    success: result.success,
                    message_count: result.message_count,
                    attachment_count: result.attachment_count,
                })
                .await;
            summary.results.push(result);
        }

        if self.export.combined_export {
            summary.combined_path = self.save_combined(&summary.results).await;
        }

        self.observer
            .session(SessionEvent::Finish {
                succeeded: summary.succeeded(),
                failed: summary.failed(),
            })
            .await;

        tracing::info!(
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            "batch export finished"
        );
        summary
    }

    async fn export_one(&self, channel: &Channel, oldest: i64, now_ms: i64) -> ExportResult {
        if let Err(e) = validate_channel_id(&channel.channel_id) {
            tracing::warn!(channel = %channel.name, error = %e, "skipping channel");
            let mut result = ExportResult::failure(&channel.channel_id, &channel.name, e.to_string());
            result.markdown = error_document(&channel.name, &e.to_string());
            if let Err(save_err) = self.save_document(&channel.name, &result.markdown).await {
                tracing::warn!(channel = %channel.name, error = %save_err, "could not save error document");
            }
            return result;
        }

        let response = self
            .exporter
            .export_channel(ChannelExportRequest {
                channel_id: channel.channel_id.clone(),
                channel_name: channel.name.clone(),
                oldest_timestamp_ms: oldest,
            })
            .await;

        if let Err(e) = record_last_export(self.store.as_ref(), &channel.channel_id, now_ms).await {
            tracing::warn!(channel = %channel.name, error = %e, "failed to record last export");
        }

        self.finish_result(channel, response).await
    }

    async fn finish_result(&self, channel: &Channel, response: ChannelExportResponse) -> ExportResult {
        let mut result = ExportResult {
            channel_id: channel.channel_id.clone(),
            channel_name: channel.name.clone(),
            success: response.success,
            message_count: response.message_count,
            attachment_count: response.attachment_count,
            markdown: response.markdown,
            error: response.error,
        };

        if !response.markdown_saved && !result.markdown.is_empty() {
            if let Err(e) = self.save_document(&channel.name, &result.markdown).await {
                tracing::error!(channel = %channel.name, error = %e, "fallback save failed");
                // A failed export keeps its original error.
                if result.success {
                    result.success = false;
                    result.error = Some(e.to_string());
                }
            }
        }
        result
    }

    async fn save_document(&self, label: &str, markdown: &str) -> Result<PathBuf> {
        let filename = format_file_name(&self.export.file_name_format, label, &Local::now());
        let policy = self.write_policy();
        let path = save_with_retry(self.sink.as_ref(), SaveRequest::text(&filename, markdown), &policy).await?;

        if self.export.write_html {
            save_html_companion(self.sink.as_ref(), &filename, markdown, &policy).await;
        }
        Ok(path)
    }

    async fn save_combined(&self, results: &[ExportResult]) -> Option<PathBuf> {
        let document = combine_documents(results, &Local::now())?;
        match self.save_document(COMBINED_FILE_LABEL, &document).await {
            Ok(path) => {
                tracing::info!(path = %path.display(), "combined export written");
                Some(path)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to write combined export");
                None
            }
        }
    }
}

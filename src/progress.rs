//! Typed progress events emitted while exporting.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where a channel export (or the batch as a whole) currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Idle,
    Starting,
    FetchingMessages,
    FetchingThreadReplies,
    EnrichingMessages,
    DownloadingAttachments,
    BuildingMarkdown,
    Done,
    Error,
    Stale,
    Finished,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Starting => "starting",
            Stage::FetchingMessages => "fetching_messages",
            Stage::FetchingThreadReplies => "fetching_thread_replies",
            Stage::EnrichingMessages => "enriching_messages",
            Stage::DownloadingAttachments => "downloading_attachments",
            Stage::BuildingMarkdown => "building_markdown",
            Stage::Done => "done",
            Stage::Error => "error",
            Stage::Stale => "stale",
            Stage::Finished => "finished",
        }
    }

    /// Per-channel pipeline stages in the order they run.
    pub const PIPELINE: [Stage; 6] = [
        Stage::FetchingMessages,
        Stage::FetchingThreadReplies,
        Stage::EnrichingMessages,
        Stage::DownloadingAttachments,
        Stage::BuildingMarkdown,
        Stage::Done,
    ];

    /// Stages a per-channel progress update may carry.
    pub fn is_channel_stage(self) -> bool {
        self == Stage::Error || Self::PIPELINE.contains(&self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a channel export, with whichever counters that step knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub channel_id: String,
    pub stage: Stage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_threads: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_threads: Option<usize>,
}

impl ProgressUpdate {
    pub fn new(channel_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            channel_id: channel_id.into(),
            stage,
            ..Default::default()
        }
    }

    pub fn messages(mut self, count: usize) -> Self {
        self.message_count = Some(count);
        self
    }

    pub fn attachments(mut self, count: usize) -> Self {
        self.attachment_count = Some(count);
        self
    }

    pub fn threads(mut self, fetched: usize, total: usize) -> Self {
        self.fetched_threads = Some(fetched);
        self.total_threads = Some(total);
        self
    }
}

/// Batch lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    #[serde(rename_all = "camelCase")]
    Start { channel_ids: Vec<String> },
    #[serde(rename_all = "camelCase")]
    ChannelStart {
        channel_id: String,
        channel_name: String,
    },
    #[serde(rename_all = "camelCase")]
    ChannelDone {
        channel_id: String,
        success: bool,
        message_count: usize,
        attachment_count: usize,
    },
    #[serde(rename_all = "camelCase")]
    Finish { succeeded: usize, failed: usize },
}

/// Receives progress while exports run. Implementations must not fail the export.
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn progress(&self, update: ProgressUpdate);
    async fn session(&self, event: SessionEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl ProgressObserver for NoopObserver {
    async fn progress(&self, _update: ProgressUpdate) {}
    async fn session(&self, _event: SessionEvent) {}
}

/// Binds an observer to one channel so pipeline steps only name the stage.
#[derive(Clone, Copy)]
pub struct ProgressReporter<'a> {
    observer: &'a dyn ProgressObserver,
    channel_id: &'a str,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(observer: &'a dyn ProgressObserver, channel_id: &'a str) -> Self {
        Self {
            observer,
            channel_id,
        }
    }

    pub fn update(&self, stage: Stage) -> ProgressUpdate {
        ProgressUpdate::new(self.channel_id, stage)
    }

    pub async fn stage(&self, stage: Stage) {
        self.send(self.update(stage)).await;
    }

    pub async fn send(&self, update: ProgressUpdate) {
        tracing::debug!(
            channel = self.channel_id,
            stage = %update.stage,
            messages = ?update.message_count,
            attachments = ?update.attachment_count,
            "progress"
        );
        self.observer.progress(update).await;
    }
}

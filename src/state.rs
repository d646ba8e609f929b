//! Durable batch export state and the reducer that keeps it current.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Result;
use crate::progress::{ProgressObserver, ProgressUpdate, SessionEvent, Stage};
use crate::store::{BATCH_STATE_KEY, KeyValueStore, get_typed, set_typed};

pub const STATE_VERSION: u32 = 1;

/// An active state not written for this long is treated as abandoned.
pub const STALE_AFTER_MS: i64 = 45_000;

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Pending,
    Active,
    Success,
    Error,
}

impl ChannelStatus {
    fn is_finished(&self) -> bool {
        matches!(self, ChannelStatus::Success | ChannelStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchExportState {
    pub version: u32,
    pub active: bool,
    pub total_channels: usize,
    pub completed_channels: usize,
    pub current_channel_id: Option<String>,
    pub current_channel_name: Option<String>,
    pub stage: Stage,
    pub message_count: usize,
    pub attachment_count: usize,
    pub fetched_threads: usize,
    pub total_threads: usize,
    pub progress_percent: u8,
    pub channel_statuses: BTreeMap<String, ChannelStatus>,
    pub updated_at: i64,
}

impl Default for BatchExportState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            active: false,
            total_channels: 0,
            completed_channels: 0,
            current_channel_id: None,
            current_channel_name: None,
            stage: Stage::Idle,
            message_count: 0,
            attachment_count: 0,
            fetched_threads: 0,
            total_threads: 0,
            progress_percent: 0,
            channel_statuses: BTreeMap::new(),
            updated_at: 0,
        }
    }
}

/// Share of one channel's work done once `stage` is reached.
fn stage_fraction(stage: Stage, fetched_threads: usize, total_threads: usize) -> f64 {
    match stage {
        Stage::FetchingMessages => 0.1,
        Stage::FetchingThreadReplies if total_threads > 0 => {
            0.2 + 0.3 * (fetched_threads.min(total_threads) as f64 / total_threads as f64)
        }
        Stage::FetchingThreadReplies => 0.2,
        Stage::EnrichingMessages => 0.5,
        Stage::DownloadingAttachments => 0.7,
        Stage::BuildingMarkdown => 0.9,
        _ => 0.0,
    }
}

impl BatchExportState {
    fn reset_counters(&mut self) {
        self.message_count = 0;
        self.attachment_count = 0;
        self.fetched_threads = 0;
        self.total_threads = 0;
    }

    fn recompute_percent(&mut self) {
        if self.total_channels == 0 {
            self.progress_percent = 0;
            return;
        }
        let in_flight = if self.active {
            stage_fraction(self.stage, self.fetched_threads, self.total_threads)
        } else {
            0.0
        };
        let done = self.completed_channels as f64 + in_flight;
        let percent = (done / self.total_channels as f64 * 100.0).floor();
        self.progress_percent = percent.clamp(0.0, 100.0) as u8;
    }

    /// Apply a batch lifecycle event.
    pub fn apply_session(&mut self, event: &SessionEvent, now: i64) {
        match event {
            SessionEvent::Start { channel_ids } => {
                *self = BatchExportState {
                    active: true,
                    total_channels: channel_ids.len(),
                    stage: Stage::Starting,
                    channel_statuses: channel_ids
                        .iter()
                        .map(|id| (id.clone(), ChannelStatus::Pending))
                        .collect(),
                    ..Default::default()
                };
            }
            SessionEvent::ChannelStart {
                channel_id,
                channel_name,
            } => {
                self.active = true;
                self.current_channel_id = Some(channel_id.clone());
                self.current_channel_name = Some(channel_name.clone());
                self.stage = Stage::Starting;
                self.reset_counters();
                self.channel_statuses
                    .insert(channel_id.clone(), ChannelStatus::Active);
            }
            SessionEvent::ChannelDone {
                channel_id,
                success,
                message_count,
                attachment_count,
            } => {
                let status = if *success {
                    ChannelStatus::Success
                } else {
                    ChannelStatus::Error
                };
                let previous = self.channel_statuses.insert(channel_id.clone(), status);
                if !previous.is_some_and(|s| s.is_finished()) {
                    self.completed_channels += 1;
                }
                self.stage = if *success { Stage::Done } else { Stage::Error };
                self.message_count = *message_count;
                self.attachment_count = *attachment_count;
            }
            SessionEvent::Finish { .. } => {
                self.active = false;
                self.stage = Stage::Finished;
                self.current_channel_id = None;
                self.current_channel_name = None;
            }
        }

        self.total_channels = self.total_channels.max(self.channel_statuses.len());
        self.completed_channels = self.completed_channels.min(self.total_channels);
        self.updated_at = now;
        self.recompute_percent();
        if matches!(event, SessionEvent::Finish { .. }) && self.total_channels > 0 {
            self.progress_percent = 100;
        }
    }

    /// Apply a pipeline progress update for the current channel.
    pub fn apply_progress(&mut self, update: &ProgressUpdate, now: i64) {
        if !update.stage.is_channel_stage() {
            tracing::debug!(stage = %update.stage, "ignoring non-channel progress stage");
            return;
        }
        if self.current_channel_id.as_deref() != Some(update.channel_id.as_str()) {
            self.current_channel_id = Some(update.channel_id.clone());
        }
        self.active = true;
        self.stage = update.stage;
        if let Some(count) = update.message_count {
            self.message_count = count;
        }
        if let Some(count) = update.attachment_count {
            self.attachment_count = count;
        }
        if let Some(count) = update.fetched_threads {
            self.fetched_threads = count;
        }
        if let Some(count) = update.total_threads {
            self.total_threads = count;
        }
        self.updated_at = now;
        self.recompute_percent();
    }

    pub fn is_stale(&self, now: i64) -> bool {
        self.active && now - self.updated_at > STALE_AFTER_MS
    }

    pub fn mark_stale(&mut self, now: i64) {
        self.active = false;
        self.stage = Stage::Stale;
        self.updated_at = now;
    }
}

/// Read the persisted state, resetting (and persisting) an abandoned active run.
pub async fn load_current_state(store: &dyn KeyValueStore, now: i64) -> Result<BatchExportState> {
    let mut state: BatchExportState = get_typed(store, BATCH_STATE_KEY).await?.unwrap_or_default();
    if state.is_stale(now) {
        tracing::info!(updated_at = state.updated_at, "batch export state is stale, resetting");
        state.mark_stale(now);
        set_typed(store, BATCH_STATE_KEY, &state).await?;
    }
    Ok(state)
}

pub async fn reset_state(store: &dyn KeyValueStore) -> Result<()> {
    set_typed(store, BATCH_STATE_KEY, &BatchExportState::default()).await
}

/// Keeps the batch state in memory and writes it through on every event.
pub struct StateTracker {
    store: Arc<dyn KeyValueStore>,
    state: Mutex<BatchExportState>,
}

impl StateTracker {
    pub async fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let state = load_current_state(store.as_ref(), now_ms()).await?;
        Ok(Self {
            store,
            state: Mutex::new(state),
        })
    }

    pub async fn current_state(&self) -> BatchExportState {
        self.current_state_at(now_ms()).await
    }

    pub async fn current_state_at(&self, now: i64) -> BatchExportState {
        let mut state = self.state.lock().await;
        if state.is_stale(now) {
            state.mark_stale(now);
            self.persist(&state).await;
        }
        state.clone()
    }

    pub async fn reset(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = BatchExportState::default();
        set_typed(self.store.as_ref(), BATCH_STATE_KEY, &*state).await
    }

    async fn persist(&self, state: &BatchExportState) {
        if let Err(e) = set_typed(self.store.as_ref(), BATCH_STATE_KEY, state).await {
            tracing::warn!(error = %e, "failed to persist batch export state");
        }
    }
}

#[async_trait]
impl ProgressObserver for StateTracker {
    async fn progress(&self, update: ProgressUpdate) {
        let mut state = self.state.lock().await;
        state.apply_progress(&update, now_ms());
        self.persist(&state).await;
    }

    async fn session(&self, event: SessionEvent) {
        let mut state = self.state.lock().await;
        state.apply_session(&event, now_ms());
        tracing::info!(
            event = ?event,
            completed = state.completed_channels,
            total = state.total_channels,
            "batch export"
        );
        self.persist(&state).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn start(ids: &[&str]) -> SessionEvent {
        SessionEvent::Start {
            channel_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn done(id: &str, success: bool) -> SessionEvent {
        SessionEvent::ChannelDone {
            channel_id: id.into(),
            success,
            message_count: 5,
            attachment_count: 1,
        }
    }

    #[test]
    fn test_reducer_lifecycle() {
        let mut state = BatchExportState::default();
        state.apply_session(&start(&["C1", "C2"]), 1);
        assert!(state.active);
        assert_eq!(state.total_channels, 2);
        assert_eq!(state.channel_statuses["C1"], ChannelStatus::Pending);

        state.apply_session(
            &SessionEvent::ChannelStart {
                channel_id: "C1".into(),
                channel_name: "general".into(),
            },
            2,
        );
        assert_eq!(state.channel_statuses["C1"], ChannelStatus::Active);
        assert_eq!(state.current_channel_name.as_deref(), Some("general"));

        state.apply_progress(
            &ProgressUpdate::new("C1", Stage::FetchingThreadReplies).threads(1, 2),
            3,
        );
        assert_eq!(state.stage, Stage::FetchingThreadReplies);
        assert_eq!(state.fetched_threads, 1);
        assert_eq!(state.progress_percent, 17);

        state.apply_progress(&ProgressUpdate::new("C1", Stage::Finished), 3);
        assert_eq!(state.stage, Stage::FetchingThreadReplies);

        state.apply_session(&done("C1", true), 4);
        assert_eq!(state.completed_channels, 1);
        assert_eq!(state.channel_statuses["C1"], ChannelStatus::Success);
        assert_eq!(state.progress_percent, 50);

        state.apply_session(&done("C2", false), 5);
        state.apply_session(&SessionEvent::Finish { succeeded: 1, failed: 1 }, 6);
        assert!(!state.active);
        assert_eq!(state.stage, Stage::Finished);
        assert_eq!(state.completed_channels, 2);
        assert_eq!(state.channel_statuses["C2"], ChannelStatus::Error);
        assert_eq!(state.progress_percent, 100);
        assert_eq!(state.updated_at, 6);
    }

    #[test]
    fn test_completed_never_exceeds_total() {
        let mut state = BatchExportState::default();
        state.apply_session(&start(&["C1"]), 1);
        state.apply_session(&done("C1", true), 2);
        state.apply_session(&done("C1", true), 3);
        state.apply_session(&done("C9", false), 4);
        assert!(state.completed_channels <= state.total_channels);
        assert_eq!(state.completed_channels, 2);
        assert_eq!(state.total_channels, 2);
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(BatchExportState::default()).unwrap();
        for key in [
            "active",
            "totalChannels",
            "completedChannels",
            "currentChannelId",
            "currentChannelName",
            "stage",
            "messageCount",
            "attachmentCount",
            "fetchedThreads",
            "totalThreads",
            "progressPercent",
            "channelStatuses",
            "updatedAt",
        ] {
            assert!(json.get(key).is_some(), "{key}");
        }
        assert_eq!(json["stage"], "idle");
        assert_eq!(json["version"], STATE_VERSION);
    }

    #[tokio::test]
    async fn test_stale_state_is_reset_on_read() {
        let store = MemoryStore::default();
        let now = 1_700_000_000_000;
        let state = BatchExportState {
            active: true,
            stage: Stage::DownloadingAttachments,
            updated_at: now - 50_000,
            ..Default::default()
        };
        set_typed(&store, BATCH_STATE_KEY, &state).await.unwrap();

        let read = load_current_state(&store, now).await.unwrap();
        assert!(!read.active);
        assert_eq!(read.stage, Stage::Stale);

        let persisted: BatchExportState = get_typed(&store, BATCH_STATE_KEY).await.unwrap().unwrap();
        assert_eq!(persisted.stage, Stage::Stale);
    }

    #[tokio::test]
    async fn test_fresh_state_is_left_alone() {
        let store = MemoryStore::default();
        let now = 1_700_000_000_000;
        let state = BatchExportState {
            active: true,
            stage: Stage::FetchingMessages,
            updated_at: now - 10_000,
            ..Default::default()
        };
        set_typed(&store, BATCH_STATE_KEY, &state).await.unwrap();
        let read = load_current_state(&store, now).await.unwrap();
        assert!(read.active);
        assert_eq!(read.stage, Stage::FetchingMessages);
    }

    #[tokio::test]
    async fn test_tracker_persists_and_goes_stale() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::default());
        let tracker = StateTracker::load(store.clone()).await.unwrap();
        tracker.session(start(&["C1"])).await;
        tracker
            .progress(ProgressUpdate::new("C1", Stage::FetchingMessages).messages(3))
            .await;

        let persisted: BatchExportState = get_typed(store.as_ref(), BATCH_STATE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert!(persisted.active);
        assert_eq!(persisted.message_count, 3);

        let later = persisted.updated_at + STALE_AFTER_MS + 1;
        let state = tracker.current_state_at(later).await;
        assert!(!state.active);
        assert_eq!(state.stage, Stage::Stale);

        tracker.reset().await.unwrap();
        assert_eq!(tracker.current_state().await.stage, Stage::Idle);
    }
}

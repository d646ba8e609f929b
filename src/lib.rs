pub mod attachments;
pub mod batch;
pub mod channel;
pub mod cli;
pub mod commands;
pub mod error;
pub mod export;
pub mod history;
pub mod markdown;
pub mod md_to_html;
pub mod model;
pub mod mrkdwn;
pub mod output;
pub mod progress;
pub mod retry;
pub mod settings;
pub mod slack;
pub mod state;
pub mod store;
pub mod text;
pub mod users;

pub use batch::{BatchExporter, BatchSummary};
pub use channel::Channel;
pub use cli::{Cli, Commands};
pub use error::{AppError, Result};
pub use export::{ChannelExport, ChannelExportRequest, ChannelExportResponse, ExportPipeline};
pub use model::{EnrichedMessage, ExportResult, FileRef, RawMessage};
pub use progress::{ProgressObserver, ProgressUpdate, SessionEvent, Stage};
pub use settings::Settings;
pub use state::{BatchExportState, StateTracker};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};

pub fn load_token() -> Result<String> {
    std::env::var("SLACK_TOKEN")
        .ok()
        .filter(|t| !t.trim().is_empty())
        .ok_or(AppError::MissingToken)
}

/// Optional `d` session cookie for workspaces that require it alongside the token.
pub fn load_cookie() -> Option<String> {
    std::env::var("SLACK_COOKIE")
        .ok()
        .filter(|c| !c.trim().is_empty())
}

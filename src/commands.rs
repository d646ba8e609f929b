use std::path::Path;
use std::sync::Arc;

use crate::batch::{BatchExporter, BatchSummary};
use crate::channel::{Channel, find_channel, validate_channel_id};
use crate::error::Result;
use crate::export::ExportPipeline;
use crate::md_to_html::convert_md_file_to_html;
use crate::output::LocalFileSink;
use crate::progress::ProgressObserver;
use crate::settings::Settings;
use crate::slack::SlackClient;
use crate::state::{StateTracker, load_current_state, now_ms, reset_state};
use crate::store::{JsonFileStore, load_last_exports};
use crate::{AppError, load_cookie, load_token};

fn load_settings(path: &str) -> Result<Settings> {
    let settings = Settings::load_from(Path::new(path))?;
    settings.validate_options()?;
    Ok(settings)
}

fn open_store(settings: &Settings) -> Arc<JsonFileStore> {
    Arc::new(JsonFileStore::new(&settings.slack.state_file))
}

/// Resolve a command-line channel argument against the configured list.
/// Unknown ids are exported under their own id as the name.
fn resolve_channel(settings: &Settings, query: &str) -> Channel {
    find_channel(&settings.channels, query)
        .cloned()
        .unwrap_or_else(|| Channel::new(query, query))
}

async fn run_batch(settings: &Settings, channels: &[Channel]) -> Result<BatchSummary> {
    let token = load_token()?;
    let client = SlackClient::with_api_url(token, &settings.slack.api_url)?.with_cookie(load_cookie());

    let store = open_store(settings);
    let tracker = Arc::new(StateTracker::load(store.clone()).await?);
    let observer: Arc<dyn ProgressObserver> = tracker;
    let sink = Arc::new(LocalFileSink::new(&settings.export.download_directory));

    let pipeline = ExportPipeline::new(client, sink.clone(), observer.clone(), settings);
    let batch = BatchExporter::new(
        Arc::new(pipeline),
        observer,
        store,
        sink,
        settings.export.clone(),
        settings.rate_limits.clone(),
    );
    Ok(batch.export_selected(channels).await)
}

fn print_summary(summary: &BatchSummary) {
    println!(
        "Export completed! {} succeeded, {} failed ({} messages, {} attachments).",
        summary.succeeded(),
        summary.failed(),
        summary.total_messages(),
        summary.total_attachments()
    );
    for result in &summary.results {
        if result.success {
            println!(
                "  ✓ {} ({}): {} messages, {} attachments",
                result.channel_name, result.channel_id, result.message_count, result.attachment_count
            );
        }
    }
    for failure in summary.failures() {
        println!(
            "  ✗ {} ({}): {}",
            failure.channel_name,
            failure.channel_id,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    if let Some(path) = &summary.combined_path {
        println!("Combined export written to {}", path.display());
    }
}

pub async fn run_export(settings_path: &str, channel_ids: Vec<String>) -> Result<()> {
    let settings = load_settings(settings_path)?;

    let channels: Vec<Channel> = if channel_ids.is_empty() {
        settings.selected_channels()
    } else {
        channel_ids.iter().map(|id| resolve_channel(&settings, id)).collect()
    };

    if channels.is_empty() {
        println!("No channels selected. Add channels to {} or pass --channel.", settings_path);
        return Ok(());
    }

    println!(
        "Exporting {} channel(s), last {} day(s), to {}...",
        channels.len(),
        settings.export.history_days,
        settings.export.download_directory
    );

    let summary = run_batch(&settings, &channels).await?;
    print_summary(&summary);
    Ok(())
}

pub async fn run_export_channel(settings_path: &str, query: &str) -> Result<()> {
    let settings = load_settings(settings_path)?;

    let channel = match find_channel(&settings.channels, query) {
        Some(channel) => channel.clone(),
        None => {
            validate_channel_id(query).map_err(|_| {
                AppError::Validation(format!("no configured channel or valid channel id matches {}", query))
            })?;
            Channel::new(query, query)
        }
    };

    println!("Exporting #{} ({})...", channel.name, channel.channel_id);

    let summary = run_batch(&settings, std::slice::from_ref(&channel)).await?;
    print_summary(&summary);
    Ok(())
}

pub async fn run_channels(settings_path: &str) -> Result<()> {
    let settings = Settings::load_from(Path::new(settings_path))?;
    let store = open_store(&settings);
    let last_exports = load_last_exports(store.as_ref()).await.unwrap_or_default();

    if settings.channels.is_empty() {
        println!("No channels configured in {}.", settings_path);
        return Ok(());
    }

    println!("{} channel(s) configured:", settings.channels.len());
    for channel in &settings.channels {
        let status = match channel.validate() {
            Ok(()) if channel.enabled => "enabled".to_string(),
            Ok(()) => "disabled".to_string(),
            Err(e) => e.to_string(),
        };
        let last = last_exports
            .get(&channel.channel_id)
            .and_then(|ms| chrono::DateTime::from_timestamp_millis(*ms))
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {} ({}) tier {} [{}] last export: {}",
            channel.name, channel.channel_id, channel.tier, status, last
        );
    }
    Ok(())
}

pub async fn run_state(settings_path: &str) -> Result<()> {
    let settings = Settings::load_from(Path::new(settings_path))?;
    let store = open_store(&settings);
    let state = load_current_state(store.as_ref(), now_ms()).await?;
    let json =
        serde_json::to_string_pretty(&state).map_err(|e| AppError::JsonSerialize(e.to_string()))?;
    println!("{}", json);
    Ok(())
}

pub async fn run_reset_state(settings_path: &str) -> Result<()> {
    let settings = Settings::load_from(Path::new(settings_path))?;
    let store = open_store(&settings);
    reset_state(store.as_ref()).await?;
    println!("Batch export state cleared ({}).", settings.slack.state_file);
    Ok(())
}

pub fn run_md_to_html(input: &str, output: Option<&str>) -> Result<()> {
    println!("Converting {} to HTML...", input);
    let path = convert_md_file_to_html(Path::new(input), output.map(Path::new))?;
    println!("HTML written to {}", path.display());
    Ok(())
}

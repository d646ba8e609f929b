use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{Channel, selectable_channels};
use crate::{AppError, Result};

pub const SETTINGS_FILE: &str = "settings.toml";

pub const DEFAULT_API_URL: &str = "https://slack.com/api";
pub const DEFAULT_STATE_FILE: &str = ".slack-export-state.json";
pub const DEFAULT_FILE_NAME_FORMAT: &str = "YYYYMMDD-HHmm-{channel}.md";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub export: ExportSettings,
    #[serde(default)]
    pub slack: SlackSettings,
    #[serde(default, rename = "rate-limits")]
    pub rate_limits: RateLimits,
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExportSettings {
    #[serde(default = "default_download_directory")]
    pub download_directory: String,
    #[serde(default = "default_file_name_format")]
    pub file_name_format: String,
    #[serde(default = "default_true")]
    pub include_timestamps: bool,
    #[serde(default = "default_true")]
    pub include_thread_replies: bool,
    #[serde(default = "default_history_days")]
    pub history_days: u32,
    #[serde(default)]
    pub combined_export: bool,
    #[serde(default = "default_true")]
    pub write_html: bool,
    #[serde(default = "default_true")]
    pub render_emoji: bool,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            download_directory: default_download_directory(),
            file_name_format: default_file_name_format(),
            include_timestamps: true,
            include_thread_replies: true,
            history_days: default_history_days(),
            combined_export: false,
            write_html: true,
            render_emoji: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SlackSettings {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            state_file: default_state_file(),
        }
    }
}

/// Pacing and retry knobs, in milliseconds unless noted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimits {
    #[serde(default = "default_page_delay")]
    pub page_delay_ms: u64,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_thread_delay")]
    pub thread_delay_ms: u64,
    #[serde(default = "default_user_lookup_delay")]
    pub user_lookup_delay_ms: u64,
    #[serde(default = "default_user_batch_delay")]
    pub user_batch_delay_ms: u64,
    #[serde(default = "default_user_batch_size")]
    pub user_batch_size: usize,
    #[serde(default = "default_file_delay")]
    pub file_delay_ms: u64,
    #[serde(default = "default_channel_delay")]
    pub channel_delay_ms: u64,
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
    #[serde(default = "default_write_retry_delay")]
    pub write_retry_delay_ms: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            page_delay_ms: default_page_delay(),
            retry_base_delay_ms: default_retry_base_delay(),
            thread_delay_ms: default_thread_delay(),
            user_lookup_delay_ms: default_user_lookup_delay(),
            user_batch_delay_ms: default_user_batch_delay(),
            user_batch_size: default_user_batch_size(),
            file_delay_ms: default_file_delay(),
            channel_delay_ms: default_channel_delay(),
            write_retries: default_write_retries(),
            write_retry_delay_ms: default_write_retry_delay(),
        }
    }
}

impl RateLimits {
    /// No pacing at all; retries still happen but without waiting.
    pub fn none() -> Self {
        Self {
            page_delay_ms: 0,
            retry_base_delay_ms: 0,
            thread_delay_ms: 0,
            user_lookup_delay_ms: 0,
            user_batch_delay_ms: 0,
            user_batch_size: default_user_batch_size(),
            file_delay_ms: 0,
            channel_delay_ms: 0,
            write_retries: default_write_retries(),
            write_retry_delay_ms: 0,
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn thread_delay(&self) -> Duration {
        Duration::from_millis(self.thread_delay_ms)
    }

    pub fn user_lookup_delay(&self) -> Duration {
        Duration::from_millis(self.user_lookup_delay_ms)
    }

    pub fn user_batch_delay(&self) -> Duration {
        Duration::from_millis(self.user_batch_delay_ms)
    }

    pub fn file_delay(&self) -> Duration {
        Duration::from_millis(self.file_delay_ms)
    }

    pub fn channel_delay(&self) -> Duration {
        Duration::from_millis(self.channel_delay_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_download_directory() -> String {
    "slack-exports".to_string()
}

fn default_file_name_format() -> String {
    DEFAULT_FILE_NAME_FORMAT.to_string()
}

fn default_history_days() -> u32 {
    7
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_state_file() -> String {
    DEFAULT_STATE_FILE.to_string()
}

fn default_page_delay() -> u64 {
    1000
}

fn default_retry_base_delay() -> u64 {
    2000
}

fn default_thread_delay() -> u64 {
    300
}

fn default_user_lookup_delay() -> u64 {
    100
}

fn default_user_batch_delay() -> u64 {
    1000
}

fn default_user_batch_size() -> usize {
    10
}

fn default_file_delay() -> u64 {
    500
}

fn default_channel_delay() -> u64 {
    3000
}

fn default_write_retries() -> u32 {
    3
}

fn default_write_retry_delay() -> u64 {
    500
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(SETTINGS_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| AppError::ReadFile {
            path: path.display().to_string(),
            source: e,
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AppError::TomlParse(e.to_string()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| AppError::TomlSerialize(e.to_string()))?;
        fs::write(path, content).map_err(|e| AppError::WriteFile {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }

    /// Full check, returning the first malformed option or channel entry.
    pub fn validate(&self) -> Result<()> {
        self.validate_options()?;
        for channel in &self.channels {
            channel.validate()?;
        }
        Ok(())
    }

    /// Check export options and rate limits only; malformed channels are
    /// reported per channel during an export instead.
    pub fn validate_options(&self) -> Result<()> {
        if self.export.history_days == 0 {
            return Err(AppError::Validation(
                "history-days must be at least 1".to_string(),
            ));
        }
        if self.rate_limits.user_batch_size == 0 {
            return Err(AppError::Validation(
                "user-batch-size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn selected_channels(&self) -> Vec<Channel> {
        selectable_channels(&self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelKind;

    #[test]
    fn test_settings_file_constant() {
        assert_eq!(SETTINGS_FILE, "settings.toml");
    }

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();

        assert_eq!(settings.export.download_directory, "slack-exports");
        assert_eq!(settings.export.file_name_format, "YYYYMMDD-HHmm-{channel}.md");
        assert!(settings.export.include_timestamps);
        assert!(settings.export.include_thread_replies);
        assert_eq!(settings.export.history_days, 7);
        assert!(!settings.export.combined_export);
        assert_eq!(settings.slack.api_url, DEFAULT_API_URL);
        assert!(settings.channels.is_empty());
        assert_eq!(settings.rate_limits.user_batch_size, 10);
    }

    #[test]
    fn test_settings_deserialization() {
        let toml_content = r#"
[export]
download-directory = "out"
file-name-format = "{channel}.md"
include-timestamps = false
history-days = 30
combined-export = true

[slack]
api-url = "http://localhost:9999/api"

[rate-limits]
page-delay-ms = 10
user-batch-size = 5

[[channels]]
name = "general"
channel-id = "C0123456789"
tier = 1
type = "channel"
enabled = true

[[channels]]
name = "dm"
channel-id = "D024BE91L"
type = "dm"
enabled = false
"#;

        let settings = Settings::parse(toml_content).unwrap();

        assert_eq!(settings.export.download_directory, "out");
        assert!(!settings.export.include_timestamps);
        assert!(settings.export.include_thread_replies);
        assert_eq!(settings.export.history_days, 30);
        assert!(settings.export.combined_export);
        assert_eq!(settings.slack.api_url, "http://localhost:9999/api");
        assert_eq!(settings.slack.state_file, DEFAULT_STATE_FILE);
        assert_eq!(settings.rate_limits.page_delay_ms, 10);
        assert_eq!(settings.rate_limits.user_batch_size, 5);
        assert_eq!(settings.rate_limits.file_delay_ms, 500);
        assert_eq!(settings.channels.len(), 2);
        assert_eq!(settings.channels[1].kind, ChannelKind::Dm);
    }

    #[test]
    fn test_settings_deserialization_empty() {
        let settings = Settings::parse("").unwrap();
        assert!(settings.channels.is_empty());
        assert_eq!(settings.export.history_days, 7);
    }

    #[test]
    fn test_settings_parse_error() {
        let err = Settings::parse("[export\nbroken").unwrap_err();
        assert!(matches!(err, AppError::TomlParse(_)));
    }

    #[test]
    fn test_selected_channels_filters_disabled_and_invalid() {
        let mut settings = Settings::default();
        settings.channels = vec![
            Channel::new("general", "C0123456789"),
            Channel::new("broken", "XYZ1"),
            Channel {
                enabled: false,
                ..Channel::new("muted", "C0000000001")
            },
        ];

        let selected = settings.selected_channels();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "general");
    }

    #[test]
    fn test_validate_reports_malformed_channel() {
        let mut settings = Settings::default();
        settings.channels = vec![Channel::new("broken", "XYZ1")];
        assert!(matches!(settings.validate(), Err(AppError::Validation(_))));
        assert!(settings.validate_options().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_history_days() {
        let mut settings = Settings::default();
        settings.export.history_days = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let mut settings = Settings::default();
        settings.export.history_days = 3;
        settings.channels = vec![Channel::new("general", "C0123456789")];
        settings.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.export.history_days, 3);
        assert_eq!(loaded.channels, settings.channels);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.export.history_days, 7);
    }

    #[test]
    fn test_rate_limits_none_has_zero_delays() {
        let limits = RateLimits::none();
        assert_eq!(limits.page_delay(), Duration::ZERO);
        assert_eq!(limits.channel_delay(), Duration::ZERO);
        assert_eq!(limits.user_batch_size, 10);
    }
}

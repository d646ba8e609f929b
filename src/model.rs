use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sender name used when an identity cannot be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";

/// Opaque user id -> display name, built once per channel export.
pub type UserMap = HashMap<String, String>;

/// A message as returned by the history and replies endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub ts: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub files: Vec<RawFile>,
    /// Single-file share field used by older file_share messages.
    #[serde(default)]
    pub file: Option<RawFile>,
    #[serde(default)]
    pub blocks: Vec<serde_json::Value>,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub reply_count: Option<u32>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub bot_profile: Option<BotProfile>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BotProfile {
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub url_private: Option<String>,
    #[serde(default)]
    pub url_private_download: Option<String>,
    #[serde(default)]
    pub permalink: Option<String>,
}

impl RawFile {
    /// Prefer the download URL, then the private URL, then the permalink.
    pub fn best_url(&self) -> Option<&str> {
        self.url_private_download
            .as_deref()
            .or(self.url_private.as_deref())
            .or(self.permalink.as_deref())
            .filter(|u| !u.is_empty())
    }
}

impl RawMessage {
    pub fn ts_seconds(&self) -> f64 {
        ts_to_seconds(&self.ts)
    }

    /// True for a thread parent that has replies to fetch.
    pub fn has_thread(&self) -> bool {
        self.reply_count.unwrap_or(0) > 0
            && self.thread_ts.as_deref().is_some_and(|t| t == self.ts)
    }
}

/// Parse a `seconds.micros` timestamp; malformed values sort first.
pub fn ts_to_seconds(ts: &str) -> f64 {
    ts.trim().parse::<f64>().unwrap_or(0.0)
}

/// An attachment referenced by a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub name: String,
    pub url: String,
    pub mimetype: String,
    pub image: bool,
    /// Found inside a rich content block rather than the files array.
    pub embedded: bool,
}

/// A message ready for rendering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedMessage {
    pub sender: String,
    pub content: String,
    pub timestamp: String,
    pub thread_replies: Vec<EnrichedMessage>,
    pub message_files: Vec<FileRef>,
}

impl EnrichedMessage {
    pub fn timestamp_seconds(&self) -> f64 {
        ts_to_seconds(&self.timestamp)
    }
}

/// Sort ascending by the numeric value of each timestamp.
pub fn sort_by_timestamp(messages: &mut [EnrichedMessage]) {
    messages.sort_by(|a, b| a.timestamp_seconds().total_cmp(&b.timestamp_seconds()));
}

/// Outcome of exporting one channel. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub channel_id: String,
    pub channel_name: String,
    pub success: bool,
    pub message_count: usize,
    pub attachment_count: usize,
    pub markdown: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportResult {
    pub fn failure(
        channel_id: impl Into<String>,
        channel_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            channel_name: channel_name.into(),
            success: false,
            message_count: 0,
            attachment_count: 0,
            markdown: String::new(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_message_deserialize_minimal() {
        let msg: RawMessage = serde_json::from_str(r#"{"ts": "1700000000.000100"}"#).unwrap();
        assert_eq!(msg.ts, "1700000000.000100");
        assert!(msg.user.is_none());
        assert!(msg.files.is_empty());
        assert!(!msg.has_thread());
    }

    #[test]
    fn test_raw_message_deserialize_full() {
        let json = serde_json::json!({
            "ts": "1700000000.000100",
            "user": "U123",
            "text": "hello",
            "thread_ts": "1700000000.000100",
            "reply_count": 2,
            "files": [{"id": "F1", "name": "a.png", "mimetype": "image/png",
                       "url_private": "https://files.slack.com/a.png"}],
            "blocks": [{"type": "rich_text"}],
            "unknown_field": true
        });
        let msg: RawMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.user.as_deref(), Some("U123"));
        assert!(msg.has_thread());
        assert_eq!(msg.files[0].best_url(), Some("https://files.slack.com/a.png"));
        assert_eq!(msg.blocks.len(), 1);
    }

    #[test]
    fn test_reply_is_not_a_thread_parent() {
        let msg = RawMessage {
            ts: "2.0".into(),
            thread_ts: Some("1.0".into()),
            reply_count: Some(3),
            ..Default::default()
        };
        assert!(!msg.has_thread());
    }

    #[test]
    fn test_best_url_preference() {
        let file = RawFile {
            url_private: Some("https://files.slack.com/private".into()),
            url_private_download: Some("https://files.slack.com/download".into()),
            ..Default::default()
        };
        assert_eq!(file.best_url(), Some("https://files.slack.com/download"));
        assert_eq!(RawFile::default().best_url(), None);
    }

    #[test]
    fn test_sort_by_timestamp_is_numeric() {
        let mut messages = vec![
            EnrichedMessage {
                timestamp: "1700000010.000001".into(),
                ..Default::default()
            },
            EnrichedMessage {
                timestamp: "999999999.999999".into(),
                ..Default::default()
            },
            EnrichedMessage {
                timestamp: "1700000002.500000".into(),
                ..Default::default()
            },
        ];
        sort_by_timestamp(&mut messages);
        let order: Vec<_> = messages.iter().map(|m| m.timestamp.as_str()).collect();
        assert_eq!(
            order,
            vec!["999999999.999999", "1700000002.500000", "1700000010.000001"]
        );
    }

    #[test]
    fn test_export_result_serializes_camel_case() {
        let result = ExportResult::failure("C1", "general", "boom");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["channelId"], "C1");
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "boom");
    }
}

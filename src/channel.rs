use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Conversation ids: a `C`, `G` or `D` prefix followed by uppercase alphanumerics.
#[allow(clippy::unwrap_used)] // literal pattern
static CHANNEL_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[CDG][A-Z0-9]{8,}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    #[default]
    Channel,
    Dm,
    Group,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelKind::Channel => "channel",
            ChannelKind::Dm => "dm",
            ChannelKind::Group => "group",
        };
        f.write_str(label)
    }
}

/// A conversation configured for export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Channel {
    pub name: String,
    pub channel_id: String,
    #[serde(default = "default_tier")]
    pub tier: u8,
    #[serde(default, rename = "type")]
    pub kind: ChannelKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_tier() -> u8 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Channel {
    pub fn new(name: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            channel_id: channel_id.into(),
            tier: default_tier(),
            kind: ChannelKind::default(),
            enabled: true,
        }
    }

    pub fn has_valid_id(&self) -> bool {
        is_valid_channel_id(&self.channel_id)
    }

    /// Enabled and carrying a well-formed id.
    pub fn is_selectable(&self) -> bool {
        self.enabled && self.has_valid_id()
    }

    /// Check a user-edited entry for malformed fields.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "channel {} has an empty name",
                self.channel_id
            )));
        }
        validate_channel_id(&self.channel_id)?;
        if !(1..=3).contains(&self.tier) {
            return Err(AppError::Validation(format!(
                "channel {} has tier {}, expected 1, 2 or 3",
                self.name, self.tier
            )));
        }
        Ok(())
    }
}

pub fn is_valid_channel_id(id: &str) -> bool {
    CHANNEL_ID_RE.is_match(id)
}

pub fn validate_channel_id(id: &str) -> Result<()> {
    if is_valid_channel_id(id) {
        Ok(())
    } else if id.trim().is_empty() {
        Err(AppError::Validation("channel id is empty".to_string()))
    } else {
        Err(AppError::Validation(format!("invalid channel id: {}", id)))
    }
}

/// Channels eligible for a batch export, in configured order.
pub fn selectable_channels(channels: &[Channel]) -> Vec<Channel> {
    channels
        .iter()
        .filter(|c| c.is_selectable())
        .cloned()
        .collect()
}

/// Find a channel by id, or by name (with or without a leading `#`).
pub fn find_channel<'a>(channels: &'a [Channel], query: &str) -> Option<&'a Channel> {
    let name = query.trim_start_matches('#');
    channels
        .iter()
        .find(|c| c.channel_id == query)
        .or_else(|| channels.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
}

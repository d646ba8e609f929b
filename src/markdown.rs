use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;

use crate::model::EnrichedMessage;
use crate::text::{escape_markdown, normalize_fence_boundaries};

pub const NO_MESSAGES_NOTE: &str = "_No messages found in this time range._";

const TIMESTAMP_FORMAT: &str = "%b %-d, %Y %-I:%M %p";

const DAY_NAMES: &[&str] = &[
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
    "today",
    "yesterday",
];

#[allow(clippy::unwrap_used)] // literal pattern
static PERMALINK_TS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[/_])p(\d{10})\d*").unwrap());

#[allow(clippy::unwrap_used)] // literal pattern
static EPOCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{1,12}(?:\.\d+)?$").unwrap());

/// Rendering switches taken from the export settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderOptions {
    pub include_timestamps: bool,
    pub include_thread_replies: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            include_timestamps: true,
            include_thread_replies: true,
        }
    }
}

/// Render messages as a Markdown document stamped with the current time.
pub fn to_markdown(messages: &[EnrichedMessage], channel_name: &str, options: &RenderOptions) -> String {
    to_markdown_at(messages, channel_name, options, Local::now())
}

/// Render messages as a Markdown document.
///
/// The only line depending on `exported_at` is the `Exported:` line, so the
/// same messages always produce the same body.
pub fn to_markdown_at<Tz: TimeZone>(
    messages: &[EnrichedMessage],
    channel_name: &str,
    options: &RenderOptions,
    exported_at: DateTime<Tz>,
) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let mut out = render_header(channel_name, &exported_at.format(TIMESTAMP_FORMAT).to_string());

    if messages.is_empty() {
        out.push_str(NO_MESSAGES_NOTE);
        out.push('\n');
        return normalize_fence_boundaries(&out);
    }

    for message in messages {
        out.push_str(&render_message_header(message, options));
        out.push_str("\n\n");
        if !message.content.is_empty() {
            out.push_str(&message.content);
            out.push_str("\n\n");
        }

        if options.include_thread_replies && !message.thread_replies.is_empty() {
            out.push_str("**Thread Replies:**\n\n");
            for reply in &message.thread_replies {
                out.push_str(&render_reply(reply));
                out.push('\n');
            }
            out.push('\n');
        }
    }

    normalize_fence_boundaries(&out)
}

fn render_header(channel_name: &str, exported: &str) -> String {
    format!("# {}\n\nExported: {}\n\n---\n\n", channel_name, exported)
}

fn render_message_header(message: &EnrichedMessage, options: &RenderOptions) -> String {
    let sender = escape_markdown(&message.sender);
    if options.include_timestamps {
        format!("**{}** ({}):", sender, format_timestamp(&message.timestamp))
    } else {
        format!("**{}**:", sender)
    }
}

fn render_reply(reply: &EnrichedMessage) -> String {
    let content = reply.content.replace('\n', "\n  ");
    format!("- **{}**: {}", escape_markdown(&reply.sender), content)
}

/// Strip a rendered document's title block (everything up to the first rule).
pub fn strip_header_block(markdown: &str) -> &str {
    match markdown.find("\n---\n") {
        Some(pos) => markdown
            .get(pos + "\n---\n".len()..)
            .unwrap_or_default()
            .trim_start_matches('\n'),
        None => markdown,
    }
}

/// Format a timestamp as `Mon D, YYYY h:mm AM/PM` in local time.
pub fn format_timestamp(value: &str) -> String {
    format_timestamp_in(value, &Local)
}

/// Format a timestamp in `tz`.
///
/// Accepts ISO-8601 strings, epoch seconds (optionally fractional) and
/// permalink tokens like `p1700000000123456`. Values that already carry a
/// weekday or relative day name, or that cannot be parsed, come back unchanged.
pub fn format_timestamp_in<Tz: TimeZone>(value: &str, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let trimmed = value.trim();
    let lower = trimmed.to_lowercase();
    if trimmed.is_empty() || DAY_NAMES.iter().any(|day| lower.contains(day)) {
        return value.to_string();
    }

    match parse_timestamp(trimmed) {
        Some(utc) => utc.with_timezone(tz).format(TIMESTAMP_FORMAT).to_string(),
        None => value.to_string(),
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if EPOCH_RE.is_match(value) {
        let seconds = value.split('.').next()?.parse::<i64>().ok()?;
        return Utc.timestamp_opt(seconds, 0).single();
    }

    if let Some(caps) = PERMALINK_TS_RE.captures(value) {
        let seconds = caps[1].parse::<i64>().ok()?;
        return Utc.timestamp_opt(seconds, 0).single();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

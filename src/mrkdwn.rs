//! Conversion of Slack message markup into Markdown.
//!
//! Slack wraps mentions and links in angle brackets (`<@U123>`, `<#C1|general>`,
//! `<https://example.com|label>`) and writes emoji as `:shortcode:`.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::model::{RawMessage, UNKNOWN_USER, UserMap};

#[allow(clippy::unwrap_used)] // literal pattern
static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<([^<>\n]+)>").unwrap());

#[allow(clippy::unwrap_used)] // literal pattern
static USER_MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@([UW][A-Z0-9]+)(?:\|[^>]*)?>").unwrap());

#[allow(clippy::unwrap_used)] // literal pattern
static EMOJI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":([a-z0-9_+\-']+(?:::skin-tone-[2-6])?):").unwrap());

/// Options controlling markup conversion.
#[derive(Debug, Clone, Copy)]
pub struct MrkdwnOptions {
    pub render_emoji: bool,
}

impl Default for MrkdwnOptions {
    fn default() -> Self {
        Self { render_emoji: true }
    }
}

/// Convert Slack markup to Markdown, resolving user mentions through `users`.
pub fn to_markdown(text: &str, users: &UserMap, options: MrkdwnOptions) -> String {
    let converted = TOKEN_RE
        .replace_all(text, |caps: &regex::Captures| convert_token(&caps[1], users))
        .into_owned();

    if options.render_emoji {
        render_emoji(&converted)
    } else {
        converted
    }
}

fn convert_token(inner: &str, users: &UserMap) -> String {
    let (target, label) = match inner.split_once('|') {
        Some((target, label)) => (target, Some(label)),
        None => (inner, None),
    };

    if let Some(user_id) = target.strip_prefix('@') {
        let name = users
            .get(user_id)
            .map(String::as_str)
            .or(label.filter(|l| !l.is_empty()))
            .unwrap_or(UNKNOWN_USER);
        return format!("@{}", name.trim_start_matches('@'));
    }

    if let Some(channel_id) = target.strip_prefix('#') {
        let name = label.filter(|l| !l.is_empty()).unwrap_or(channel_id);
        return format!("#{}", name);
    }

    if let Some(special) = target.strip_prefix('!') {
        if let Some(label) = label.filter(|l| !l.is_empty()) {
            return label.to_string();
        }
        let keyword = special.split('^').next().unwrap_or(special);
        return format!("@{}", keyword);
    }

    match label {
        Some(label) if !label.is_empty() && label != target => format!("[{}]({})", label, target),
        _ => target.to_string(),
    }
}

/// Replace `:shortcode:` emoji with unicode, honouring `::skin-tone-N` suffixes.
pub fn render_emoji(text: &str) -> String {
    EMOJI_RE
        .replace_all(text, |caps: &regex::Captures| {
            emoji_for(&caps[1]).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn emoji_for(name: &str) -> Option<String> {
    let mut parts = name.split("::skin-tone-");
    let base = parts.next()?;
    let emoji = emojis::get_by_shortcode(base)?;
    let Some(tone) = parts.next().and_then(|t| t.parse::<usize>().ok()) else {
        return Some(emoji.to_string());
    };
    let skinned = emoji
        .skin_tones()
        .and_then(|mut tones| tones.nth(tone.saturating_sub(1)));
    Some(skinned.unwrap_or(emoji).to_string())
}

/// User ids mentioned in `text` via `<@U…>` tokens.
pub fn mentioned_user_ids(text: &str) -> Vec<String> {
    USER_MENTION_RE
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Every user id a message refers to: its author, text mentions and rich-text user elements.
pub fn referenced_user_ids(message: &RawMessage, ids: &mut BTreeSet<String>) {
    if let Some(user) = message.user.as_deref().filter(|u| !u.is_empty()) {
        ids.insert(user.to_string());
    }
    if let Some(text) = message.text.as_deref() {
        ids.extend(mentioned_user_ids(text));
    }
    for block in &message.blocks {
        find_user_elements(block, ids);
    }
}

fn find_user_elements(value: &serde_json::Value, ids: &mut BTreeSet<String>) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("type").and_then(|t| t.as_str()) == Some("user")
                && let Some(user_id) = map.get("user_id").and_then(|u| u.as_str())
            {
                ids.insert(user_id.to_string());
            }
            if let Some(elements) = map.get("elements") {
                find_user_elements(elements, ids);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                find_user_elements(item, ids);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> UserMap {
        UserMap::from([
            ("U123".to_string(), "Alice".to_string()),
            ("W999".to_string(), "Bob".to_string()),
        ])
    }

    fn convert(text: &str) -> String {
        to_markdown(text, &users(), MrkdwnOptions::default())
    }

    #[test]
    fn test_user_mention_resolves_to_name() {
        assert_eq!(convert("<@U123> hi"), "@Alice hi");
        assert_eq!(convert("ping <@W999|bob>"), "ping @Bob");
    }

    #[test]
    fn test_unknown_user_mention() {
        assert_eq!(convert("<@U000> hi"), "@Unknown User hi");
        assert_eq!(convert("<@U000|carol> hi"), "@carol hi");
    }

    #[test]
    fn test_channel_mentions() {
        assert_eq!(convert("see <#C0123456789|general>"), "see #general");
        assert_eq!(convert("see <#C0123456789>"), "see #C0123456789");
    }

    #[test]
    fn test_special_mentions() {
        assert_eq!(convert("<!here> deploy"), "@here deploy");
        assert_eq!(convert("<!channel>"), "@channel");
        assert_eq!(convert("<!subteam^S123|@oncall> look"), "@oncall look");
        assert_eq!(
            convert("<!date^1392734382^{date}|Feb 18, 2014>"),
            "Feb 18, 2014"
        );
    }

    #[test]
    fn test_links() {
        assert_eq!(
            convert("read <https://example.com/a?b=1|the docs>"),
            "read [the docs](https://example.com/a?b=1)"
        );
        assert_eq!(convert("<https://example.com>"), "https://example.com");
        assert_eq!(
            convert("<mailto:a@b.com|a@b.com>"),
            "[a@b.com](mailto:a@b.com)"
        );
    }

    #[test]
    fn test_escaped_angle_brackets_are_left_alone() {
        assert_eq!(convert("a &lt;b&gt; c"), "a &lt;b&gt; c");
    }

    #[test]
    fn test_emoji_rendering() {
        assert_eq!(convert("ship it :rocket:"), "ship it 🚀");
        assert_eq!(convert(":not_a_real_emoji_name:"), ":not_a_real_emoji_name:");
        assert_eq!(
            to_markdown(":rocket:", &users(), MrkdwnOptions { render_emoji: false }),
            ":rocket:"
        );
    }

    #[test]
    fn test_emoji_skin_tone_falls_back_to_base() {
        let rendered = render_emoji(":rocket::skin-tone-3:");
        assert_eq!(rendered, "🚀");
    }

    #[test]
    fn test_mentioned_user_ids() {
        let ids = mentioned_user_ids("<@U123> and <@W999|bob> but not <#C1>");
        assert_eq!(ids, vec!["U123".to_string(), "W999".to_string()]);
    }

    #[test]
    fn test_referenced_user_ids_walks_blocks() {
        let message = RawMessage {
            ts: "1.0".into(),
            user: Some("U1".into()),
            text: Some("hey <@U2>".into()),
            blocks: vec![serde_json::json!({
                "type": "rich_text",
                "elements": [{
                    "type": "rich_text_section",
                    "elements": [
                        {"type": "user", "user_id": "U3"},
                        {"type": "text", "text": "hi"}
                    ]
                }]
            })],
            ..Default::default()
        };
        let mut ids = BTreeSet::new();
        referenced_user_ids(&message, &mut ids);
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["U1".to_string(), "U2".to_string(), "U3".to_string()]
        );
    }
}

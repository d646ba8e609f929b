//! Text cleanup, Markdown escaping and code-fence repair.
//!
//! Everything here is pure and deterministic: identical input always gives
//! identical output, which keeps exported documents diff-stable.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

/// Characters escaped in sender names.
pub const MARKDOWN_METACHARS: &[char] = &['\\', '*', '_', '`', '~', '[', ']', '(', ')', '!', '#', '|'];

const FENCE_MARKERS: [&str; 2] = ["```", "~~~"];

/// `**name** (time):` or `**name**:` on a line of its own.
///
/// The name allows backslash escapes but no bare `*`, backtick or `~`, so a
/// header line never contains a fence marker.
#[allow(clippy::unwrap_used)] // literal pattern
static MESSAGE_HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*\*(?:[^*`~\\\n]|\\.)+\*\*(?: \([^()`~\n]*\))?:$").unwrap()
});

#[allow(clippy::unwrap_used)] // literal pattern
static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]{1,7}|#[xX][0-9a-fA-F]{1,6}|[a-zA-Z]{2,8});").unwrap());

/// Decode the HTML entities that show up in message text.
pub fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
            {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                named_entity(entity)
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "hellip" => '\u{2026}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        "copy" => '\u{a9}',
        _ => return None,
    };
    Some(c)
}

/// Normalize raw message text.
///
/// Decodes entities, unifies line endings, turns non-breaking spaces into
/// spaces, collapses runs of spaces and tabs, trims each line and squeezes
/// any run of blank lines down to a single blank line.
pub fn clean(text: &str) -> String {
    let decoded = decode_entities(text);
    let normalized = decoded
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{a0}', " ");

    let mut lines: Vec<String> = Vec::new();
    let mut blank_run = 0;
    for line in normalized.split('\n') {
        let collapsed = collapse_whitespace(line);
        if collapsed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(collapsed);
    }

    lines.join("\n").trim_matches('\n').to_string()
}

fn collapse_whitespace(line: &str) -> String {
    line.split([' ', '\t'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Backslash-escape Markdown metacharacters. Only meant for sender names.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_METACHARS.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub fn is_message_header(line: &str) -> bool {
    MESSAGE_HEADER_RE.is_match(line.trim())
}

/// Position and marker of the first fence marker in `line`.
fn find_marker(line: &str) -> Option<(usize, &'static str)> {
    FENCE_MARKERS
        .iter()
        .filter_map(|m| line.find(m).map(|pos| (pos, *m)))
        .min_by_key(|(pos, _)| *pos)
}

/// Repair code-fence boundaries so every fence is balanced and sits on its own line.
///
/// The pass is line oriented and idempotent: running it on its own output is a no-op.
pub fn normalize_fence_boundaries(markdown: &str) -> String {
    let mut pending: VecDeque<String> = markdown.split('\n').map(str::to_string).collect();
    let mut out: Vec<String> = Vec::with_capacity(pending.len());
    let mut open: Option<&'static str> = None;

    while let Some(line) = pending.pop_front() {
        match open {
            Some(marker) => {
                // A message header never belongs inside a code block.
                if is_message_header(&line) {
                    out.push(marker.to_string());
                    open = None;
                    pending.push_front(line);
                    continue;
                }

                let Some(pos) = line.find(marker) else {
                    out.push(line);
                    continue;
                };

                let (before, after) = line.split_at(pos);
                if is_message_header(before) {
                    out.push(marker.to_string());
                    out.push(before.trim().to_string());
                    open = None;
                    pending.push_front(after.to_string());
                    continue;
                }

                let rest = after[marker.len()..].trim();
                if !before.trim().is_empty() {
                    // Inline close: `code...```trailing`
                    out.push(before.trim_end().to_string());
                }
                out.push(marker.to_string());
                open = None;
                if !rest.is_empty() {
                    pending.push_front(rest.to_string());
                }
            }
            None => {
                let Some((pos, marker)) = find_marker(&line) else {
                    out.push(line);
                    continue;
                };

                let prefix = &line[..pos];
                let after = &line[pos + marker.len()..];

                if let Some(close) = after
                    .find(marker)
                    .filter(|close| !is_message_header(&after[..*close]))
                {
                    // Inline complete fence: `prefix ```code``` suffix`
                    let code = &after[..close];
                    let suffix = after[close + marker.len()..].trim();
                    if !prefix.trim().is_empty() {
                        out.push(prefix.trim_end().to_string());
                    }
                    out.push(marker.to_string());
                    if !code.trim().is_empty() {
                        out.push(code.trim().to_string());
                    }
                    out.push(marker.to_string());
                    if !suffix.is_empty() {
                        pending.push_front(suffix.to_string());
                    }
                } else if pos == 0 {
                    // Regular opener, possibly with an info string.
                    out.push(line.clone());
                    open = Some(marker);
                } else if after.trim().is_empty() {
                    // Opening marker at the end of a text line.
                    if !prefix.trim().is_empty() {
                        out.push(prefix.trim_end().to_string());
                    }
                    out.push(marker.to_string());
                    open = Some(marker);
                } else {
                    out.push(line);
                }
            }
        }
    }

    if let Some(marker) = open {
        out.push(marker.to_string());
    }

    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp; b &lt;c&gt;"), "a & b <c>");
        assert_eq!(decode_entities("&#39;quoted&#x27;"), "'quoted'");
        assert_eq!(decode_entities("&bogus; stays"), "&bogus; stays");
    }

    #[test]
    fn test_clean_normalizes_whitespace() {
        let raw = "  hello\t\tworld  \r\n\r\n\r\n\r\nnext&nbsp;line  ";
        assert_eq!(clean(raw), "hello world\n\nnext line");
    }

    #[test]
    fn test_clean_collapses_blank_runs_to_one() {
        assert_eq!(clean("a\n\n\n\n\nb"), "a\n\nb");
        assert_eq!(clean("a\n\nb"), "a\n\nb");
        assert_eq!(clean("\n\n\na\n\n\n"), "a");
    }

    #[test]
    fn test_clean_is_deterministic() {
        let raw = "x  &amp;  y\r\n  z ";
        assert_eq!(clean(raw), clean(raw));
        assert_eq!(clean(&clean(raw)), clean(raw));
    }

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("a*b_c"), "a\\*b\\_c");
        assert_eq!(escape_markdown("[x](y)!#|~`\\"), "\\[x\\]\\(y\\)\\!\\#\\|\\~\\`\\\\");
        assert_eq!(escape_markdown("plain name"), "plain name");
    }

    #[test]
    fn test_is_message_header() {
        assert!(is_message_header("**Alice** (Jan 2, 2024 3:04 AM):"));
        assert!(is_message_header("**Alice**:"));
        assert!(!is_message_header("**Alice** said hi"));
        assert!(!is_message_header("- **Bob**: reply"));
        assert!(is_message_header("**a\\*b\\`c** (Jan 2, 2024 3:04 AM):"));
        assert!(!is_message_header("**Al**:```````**Al**:"));
        assert!(!is_message_header("**A** (```):"));
    }

    #[test]
    fn test_balanced_fence_untouched() {
        let md = "text\n```rust\nfn main() {}\n```\nafter";
        assert_eq!(normalize_fence_boundaries(md), md);
    }

    #[test]
    fn test_header_force_closes_open_fence() {
        let md = "**A** (Jan 1, 2024 1:00 PM):\n\n```\nunterminated\n\n**B** (Jan 1, 2024 1:05 PM):\n\nhello";
        let fixed = normalize_fence_boundaries(md);
        assert_eq!(
            fixed,
            "**A** (Jan 1, 2024 1:00 PM):\n\n```\nunterminated\n\n```\n**B** (Jan 1, 2024 1:05 PM):\n\nhello"
        );
    }

    #[test]
    fn test_inline_close_is_split() {
        let md = "```\nlet x = 1;```and then";
        assert_eq!(
            normalize_fence_boundaries(md),
            "```\nlet x = 1;\n```\nand then"
        );
    }

    #[test]
    fn test_inline_complete_fence_is_split() {
        let md = "run ```cargo test``` now";
        assert_eq!(
            normalize_fence_boundaries(md),
            "run\n```\ncargo test\n```\nnow"
        );
    }

    #[test]
    fn test_trailing_opener_is_split() {
        let md = "here is code:```\nx = 1\n```";
        assert_eq!(
            normalize_fence_boundaries(md),
            "here is code:\n```\nx = 1\n```"
        );
    }

    #[test]
    fn test_unclosed_fence_is_closed_at_end() {
        assert_eq!(normalize_fence_boundaries("```\ncode"), "```\ncode\n```");
    }

    #[test]
    fn test_tilde_fence_ignores_backticks() {
        let md = "~~~\n```\n~~~";
        assert_eq!(normalize_fence_boundaries(md), md);
    }

    #[test]
    fn test_header_with_fence_markers_is_split_in_one_pass() {
        let md = "```\n**Al**:```````**Al**:";
        assert_eq!(
            normalize_fence_boundaries(md),
            "```\n```\n**Al**:\n```\n```\n`**Al**:"
        );
    }

    #[test]
    fn test_normalize_is_a_fixed_point() {
        let inputs = [
            "a ```b``` c ```d",
            "```\nx```y```z",
            "~~~py\nprint()\n**X**:\nmore```",
            "```one``````two```",
            "```\n**A**:```tail",
            "```**A**:```",
            "```\n**Al**:```````**Al**:",
            "~~~\n**A** (x):~~~~**B**:\n```",
            "plain",
            "",
        ];
        for input in inputs {
            let once = normalize_fence_boundaries(input);
            let twice = normalize_fence_boundaries(&once);
            assert_eq!(once, twice, "input: {input:?}");
        }
    }
}

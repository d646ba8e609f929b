//! Markdown to standalone HTML.
//!
//! Rendering is done by the `markdown` crate with raw HTML escaped. Before
//! compiling, links, images and definitions whose target fails
//! [`is_safe_url`] are rewritten to their plain text.

use std::fs;
use std::path::{Path, PathBuf};

use markdown::mdast::Node;

use crate::output::{FileSink, SaveRequest, html_file_name, save_with_retry};
use crate::retry::RetryPolicy;
use crate::{AppError, Result};

const DEFAULT_TITLE: &str = "Slack Export";

// Each pass removes the outermost unsafe nodes; nested ones surface on the next.
const MAX_SANITIZE_PASSES: usize = 16;

const STYLE: &str = "body{font-family:-apple-system,BlinkMacSystemFont,\"Segoe UI\",Helvetica,Arial,sans-serif;\
line-height:1.5;max-width:860px;margin:2rem auto;padding:0 1rem;color:#1d1c1d}\
h1,h2,h3{line-height:1.25}hr{border:0;border-top:1px solid #ddd;margin:1.5rem 0}\
pre{background:#f6f8fa;padding:.75rem;border-radius:6px;overflow-x:auto}\
code{font-family:SFMono-Regular,Consolas,Menlo,monospace;font-size:.9em}\
p code,li code{background:#f6f8fa;padding:.1em .3em;border-radius:4px}\
blockquote{margin:0;padding-left:1rem;border-left:4px solid #ddd;color:#555}\
img{max-width:100%}";

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Allow-list for `href`/`src` values.
///
/// Accepts `http:`, `https:`, `mailto:`, fragments, root-absolute paths,
/// `./` and `../` paths and bare relative paths without a scheme.
pub fn is_safe_url(url: &str) -> bool {
    if url.is_empty() || url.chars().any(|c| c.is_whitespace() || c.is_control() || c == '\\') {
        return false;
    }

    let lower = url.to_ascii_lowercase();
    if ["http://", "https://", "mailto:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return true;
    }
    if url.starts_with('#') || url.starts_with("./") || url.starts_with("../") {
        return true;
    }
    if url.starts_with('/') {
        return !url.starts_with("//");
    }

    // Bare relative path: no colon before the first path, query or fragment delimiter.
    let head = url.split(['/', '?', '#']).next().unwrap_or(url);
    !head.contains(':')
}

fn markdown_options() -> markdown::Options {
    markdown::Options::gfm()
}

fn convert_error(err: impl std::fmt::Display) -> AppError {
    AppError::MarkdownConvert(err.to_string())
}

/// Backslash-escape ASCII punctuation so text is inserted literally.
fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c.is_ascii_punctuation() {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

struct Splice {
    start: usize,
    end: usize,
    text: String,
}

fn children_source(children: &[Node], source: &str) -> String {
    let start = children.first().and_then(Node::position).map(|p| p.start.offset);
    let end = children.last().and_then(Node::position).map(|p| p.end.offset);
    match (start, end) {
        (Some(start), Some(end)) => source.get(start..end).unwrap_or_default().to_string(),
        _ => String::new(),
    }
}

fn collect_unsafe(node: &Node, source: &str, out: &mut Vec<Splice>) {
    let replacement = match node {
        Node::Link(link) if !is_safe_url(&link.url) => Some(children_source(&link.children, source)),
        Node::Image(image) if !is_safe_url(&image.url) => Some(escape_markdown(&image.alt)),
        Node::Definition(definition) if !is_safe_url(&definition.url) => Some(String::new()),
        _ => None,
    };

    if let Some(text) = replacement {
        if let Some(position) = node.position() {
            out.push(Splice {
                start: position.start.offset,
                end: position.end.offset,
                text,
            });
        }
        return;
    }

    if let Some(children) = node.children() {
        for child in children {
            collect_unsafe(child, source, out);
        }
    }
}

/// Rewrite links and images with disallowed targets to plain text.
fn strip_unsafe_links(markdown: &str, options: &markdown::ParseOptions) -> Result<String> {
    let mut source = markdown.to_string();

    for _ in 0..MAX_SANITIZE_PASSES {
        let tree = markdown::to_mdast(&source, options).map_err(convert_error)?;
        let mut splices = Vec::new();
        collect_unsafe(&tree, &source, &mut splices);
        if splices.is_empty() {
            break;
        }

        // Outermost nodes never overlap, so splicing back to front keeps offsets valid.
        splices.sort_by(|a, b| b.start.cmp(&a.start));
        let mut changed = false;
        for splice in splices {
            if splice.start <= splice.end
                && splice.end <= source.len()
                && source.is_char_boundary(splice.start)
                && source.is_char_boundary(splice.end)
            {
                source.replace_range(splice.start..splice.end, &splice.text);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    Ok(source)
}

/// Convert Markdown to an HTML body fragment.
pub fn markdown_to_html(markdown: &str) -> Result<String> {
    let options = markdown_options();
    let safe = strip_unsafe_links(markdown, &options.parse)?;
    markdown::to_html_with_options(&safe, &options).map_err(convert_error)
}

fn document_title(markdown: &str) -> String {
    markdown
        .lines()
        .find_map(|line| line.trim().strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .unwrap_or_else(|| DEFAULT_TITLE.to_string())
}

/// Convert Markdown to a standalone HTML document with embedded styling.
pub fn convert_md_to_html(markdown: &str) -> Result<String> {
    Ok(format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
<title>{}</title>\n<style>{}</style>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(&document_title(markdown)),
        STYLE,
        markdown_to_html(markdown)?
    ))
}

/// Write the HTML companion of `markdown_name`. Failures are logged, not returned.
pub async fn save_html_companion(
    sink: &dyn FileSink,
    markdown_name: &str,
    markdown: &str,
    policy: &RetryPolicy,
) {
    let html = match convert_md_to_html(markdown) {
        Ok(html) => html,
        Err(e) => {
            tracing::warn!(file = %markdown_name, error = %e, "failed to convert HTML companion");
            return;
        }
    };

    let request = SaveRequest::text(html_file_name(markdown_name), html).with_mime_type("text/html");
    if let Err(e) = save_with_retry(sink, request, policy).await {
        tracing::warn!(file = %markdown_name, error = %e, "failed to write HTML companion");
    }
}

/// Convert a Markdown file to an HTML file next to it (or at `output_path`).
pub fn convert_md_file_to_html(input_path: &Path, output_path: Option<&Path>) -> Result<PathBuf> {
    let content = fs::read_to_string(input_path).map_err(|e| AppError::ReadFile {
        path: input_path.display().to_string(),
        source: e,
    })?;

    let html = convert_md_to_html(&content)?;

    let output = match output_path {
        Some(p) => p.to_path_buf(),
        None => {
            let name = input_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("output");
            input_path.with_file_name(html_file_name(name))
        }
    };

    fs::write(&output, html).map_err(|e| AppError::WriteFile {
        path: output.display().to_string(),
        source: e,
    })?;

    Ok(output)
}

//! Markdown helpers: front-matter splitting, plain-text previews, tags.
//!
//! Front-matter parsing is best-effort. A malformed block never fails the
//! caller; it yields an empty map and a warning the scanner logs.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

use crate::models::Frontmatter;

/// A markdown document split into front-matter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMarkdown {
    pub frontmatter: Frontmatter,
    /// Text after the front-matter block (the whole text if there is none).
    pub body: String,
    /// Set when a front-matter block was present but could not be parsed.
    pub warning: Option<String>,
}

/// Split a leading `---` fenced YAML block from the body and parse it.
pub fn parse_frontmatter(text: &str) -> ParsedMarkdown {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let Some((yaml, body)) = split_block(text) else {
        return ParsedMarkdown {
            frontmatter: Frontmatter::new(),
            body: text.to_string(),
            warning: None,
        };
    };

    let (frontmatter, warning) = if yaml.trim().is_empty() {
        (Frontmatter::new(), None)
    } else {
        match serde_yaml::from_str::<Value>(yaml) {
            Ok(Value::Object(map)) => (map, None),
            Ok(Value::Null) => (Frontmatter::new(), None),
            Ok(_) => (
                Frontmatter::new(),
                Some("front-matter is not a key/value mapping".to_string()),
            ),
            Err(e) => (Frontmatter::new(), Some(format!("invalid front-matter: {}", e))),
        }
    };

    ParsedMarkdown {
        frontmatter,
        body: body.to_string(),
        warning,
    }
}

/// Returns `(yaml, body)` when `text` opens with a closed `---` block.
fn split_block(text: &str) -> Option<(&str, &str)> {
    let rest = text
        .strip_prefix("---\r\n")
        .or_else(|| text.strip_prefix("---\n"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == "---" {
            let yaml = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((yaml, body));
        }
        offset += line.len();
    }
    None
}

lazy_static! {
    static ref CODE_BLOCK: Regex = Regex::new(r"(?s)```.*?```").unwrap();
    static ref HEADING: Regex = Regex::new(r"#{1,6}\s").unwrap();
    static ref BOLD: Regex = Regex::new(r"\*\*(.+?)\*\*").unwrap();
    static ref ITALIC: Regex = Regex::new(r"\*(.+?)\*").unwrap();
    static ref LINK: Regex = Regex::new(r"\[(.+?)\]\(.+?\)").unwrap();
    static ref INLINE_CODE: Regex = Regex::new(r"`(.+?)`").unwrap();
}

/// Strip common markdown formatting.
pub fn strip_markup(body: &str) -> String {
    let text = CODE_BLOCK.replace_all(body, "");
    let text = HEADING.replace_all(&text, "");
    let text = BOLD.replace_all(&text, "$1");
    let text = ITALIC.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = INLINE_CODE.replace_all(&text, "$1");
    text.trim().to_string()
}

/// Plain-text preview of at most `max_chars` characters plus `...`.
///
/// Text that already fits is returned unchanged. Longer text is cut at the
/// last space inside the limit (or at the limit when there is none).
pub fn create_preview(body: &str, max_chars: usize) -> String {
    let plain = strip_markup(body);
    if plain.chars().count() <= max_chars {
        return plain;
    }

    let cut = plain
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(plain.len());
    let head = &plain[..cut];
    let head = match head.rfind(' ') {
        Some(space) if space > 0 => &head[..space],
        _ => head,
    };
    format!("{}...", head.trim_end())
}

/// The `tags` entry as a list, whether it was written as a list or a scalar.
pub fn tags(frontmatter: &Frontmatter) -> Vec<String> {
    match frontmatter.get("tags") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter_map(scalar_to_string).collect(),
        Some(other) => scalar_to_string(other).into_iter().collect(),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

//! Defensive extraction of JSON from raw model output.
//!
//! Even with a strict JSON response format requested, models wrap payloads
//! in markdown fences, prepend chatter, or leak reasoning blocks. Every
//! stage executor funnels raw text through [`parse_json_object`] before
//! interpreting it.

use serde_json::Value;

/// Strip `<think>…</think>` / `<thinking>…</thinking>` blocks.
///
/// Handles complete blocks, unterminated blocks (stripped to end of text),
/// and multiple sequential blocks.
#[must_use]
pub fn strip_think_tags(text: &str) -> String {
    let stripped = strip_tag_variant(text, "<think>", "</think>");
    strip_tag_variant(&stripped, "<thinking>", "</thinking>")
}

fn strip_tag_variant(text: &str, open: &str, close: &str) -> String {
    let mut result = text.to_string();
    while let Some(start) = result.find(open) {
        if let Some(end_offset) = result[start..].find(close) {
            let end = start + end_offset + close.len();
            result = format!("{}{}", &result[..start], &result[end..]);
        } else {
            result.truncate(start);
            break;
        }
    }
    result
}

/// Content of the first fenced code block, preferring ```` ```json ````
/// fences over bare ones.
#[must_use]
pub fn extract_fenced_block(text: &str) -> Option<&str> {
    extract_block_with_lang(text, Some("json")).or_else(|| extract_block_with_lang(text, None))
}

fn extract_block_with_lang<'a>(text: &'a str, lang: Option<&str>) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(fence_start) = text[search_from..].find("```") {
        let after_backticks = search_from + fence_start + 3;
        let line_end = text[after_backticks..].find('\n')?;
        let lang_str = text[after_backticks..after_backticks + line_end].trim();
        let content_start = after_backticks + line_end + 1;

        let lang_matches = match lang {
            Some(wanted) => lang_str.eq_ignore_ascii_case(wanted),
            None => true,
        };
        if lang_matches {
            if let Some(close) = text[content_start..].find("```") {
                return Some(text[content_start..content_start + close].trim());
            }
        }
        search_from = after_backticks;
    }
    None
}

/// Parse model output into a JSON value.
///
/// Order of attempts: think-tag stripping, direct parse, fenced-block parse,
/// then a bracket scan from the first `{` or `[` to the matching end of
/// text. Returns `None` when nothing parses.
#[must_use]
pub fn parse_json_object(text: &str) -> Option<Value> {
    let cleaned = strip_think_tags(text);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(block) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(block) {
            return Some(value);
        }
    }
    // Last resort: widest slice starting at the first opening bracket.
    let start = trimmed.find(['{', '['])?;
    let open = trimmed.as_bytes()[start];
    let close = if open == b'{' { '}' } else { ']' };
    let end = trimmed.rfind(close)?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

//! Comment hygiene applied before the clustering prompt is built.
//!
//! Three independent filters, in order:
//!
//! 1. **Meaningfulness** — a comment shorter than [`MIN_MEANINGFUL_CHARS`]
//!    characters *and* [`MIN_MEANINGFUL_WORDS`] words carries no signal and
//!    is dropped.
//! 2. **Size** — oversized comments are truncated to [`MAX_COMMENT_CHARS`]
//!    characters (on a char boundary).
//! 3. **Injection** — comments matching any pattern in the compiled
//!    [`RegexSet`] are rejected outright; they never reach a prompt.
//!
//! Filtering never fails the stage: counts are reported back through
//! [`FilterReport`] and logged by the caller.

use regex::RegexSet;
use std::sync::LazyLock;
use tracing::debug;

use crate::input::Comment;

/// Comments below this character count *and* word count are dropped.
pub const MIN_MEANINGFUL_CHARS: usize = 10;
pub const MIN_MEANINGFUL_WORDS: usize = 3;

/// Comments are truncated to this many characters before prompting.
pub const MAX_COMMENT_CHARS: usize = 10_000;

/// Prompt-injection shapes seen in crowd-sourced comment batches. All
/// case-insensitive; matching any one rejects the comment.
static INJECTION_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)ignore\s+(all\s+)?(previous|prior|above)\s+(instructions|prompts?)",
        r"(?i)disregard\s+(all\s+)?(previous|prior|your)\s+(instructions|rules)",
        r"(?i)forget\s+(all\s+)?(previous|your)\s+(instructions|training)",
        r"(?i)you\s+are\s+now\s+",
        r"(?i)act\s+as\s+(if\s+you\s+are|a|an)\s+",
        r"(?i)pretend\s+(to\s+be|you\s+are)\s+",
        r"(?i)(reveal|print|repeat|show)\s+(your\s+)?(system\s+prompt|hidden\s+instructions)",
        r"(?i)new\s+instructions?\s*:",
        r"(?i)<\|?im_start\|?>|<\|?im_end\|?>",
        r"(?i)\[/?(system|inst)\]",
    ])
    .expect("builtin injection patterns must compile")
});

/// What the sanitization pass removed or rewrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterReport {
    /// Comments dropped for carrying no signal.
    pub dropped_short: usize,
    /// Comments kept but truncated to [`MAX_COMMENT_CHARS`].
    pub truncated: usize,
    /// Comments rejected by the injection patterns.
    pub rejected_injection: usize,
}

impl FilterReport {
    /// Fraction of the incoming batch rejected as unsafe.
    #[must_use]
    pub fn unsafe_fraction(&self, incoming: usize) -> f64 {
        if incoming == 0 {
            0.0
        } else {
            self.rejected_injection as f64 / incoming as f64
        }
    }
}

fn is_meaningful(text: &str) -> bool {
    let trimmed = text.trim();
    trimmed.chars().count() >= MIN_MEANINGFUL_CHARS
        || trimmed.split_whitespace().count() >= MIN_MEANINGFUL_WORDS
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Apply all filters to a batch. Returns the surviving comments (truncated
/// where needed) and the counts of what was filtered.
#[must_use]
pub fn sanitize_comments(comments: &[Comment]) -> (Vec<Comment>, FilterReport) {
    let mut report = FilterReport::default();
    let mut kept = Vec::with_capacity(comments.len());

    for comment in comments {
        if !is_meaningful(&comment.text) {
            report.dropped_short += 1;
            debug!(comment_id = %comment.id, "dropping comment below meaningfulness threshold");
            continue;
        }
        if INJECTION_PATTERNS.is_match(&comment.text) {
            report.rejected_injection += 1;
            debug!(comment_id = %comment.id, "rejecting comment matching injection pattern");
            continue;
        }
        let mut comment = comment.clone();
        if comment.text.chars().count() > MAX_COMMENT_CHARS {
            comment.text = truncate_chars(&comment.text, MAX_COMMENT_CHARS).to_string();
            report.truncated += 1;
        }
        kept.push(comment);
    }

    (kept, report)
}

//! Text processing utilities.

use regex::Regex;
use std::sync::OnceLock;

static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();
static PUNCTUATION_RE: OnceLock<Regex> = OnceLock::new();

fn whitespace_re() -> &'static Regex {
    WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("static regex is valid"))
}

fn punctuation_re() -> &'static Regex {
    PUNCTUATION_RE.get_or_init(|| Regex::new(r"[^\p{L}\p{N}\s]+").expect("static regex is valid"))
}

/// Replace consecutive whitespace (spaces, tabs, newlines) with a single space
/// and trim leading/trailing whitespace.
///
/// Returns an empty string for inputs that are entirely whitespace.
pub fn normalize_whitespace(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    whitespace_re().replace_all(s, " ").trim().to_string()
}

/// Normalise an entity surface string for fuzzy comparison.
///
/// Case-folds, replaces punctuation with spaces, collapses whitespace and then
/// strips trailing legal-entity suffixes (`"Acme Pty. Ltd."` → `"acme"`).
/// Suffixes are only removed while at least one other token remains, so a name
/// that consists solely of a suffix word is kept as-is.
pub fn normalize_entity_name(s: &str, legal_suffixes: &[String]) -> String {
    let lowered = s.to_lowercase();
    let stripped = punctuation_re().replace_all(&lowered, " ");
    let mut tokens: Vec<&str> = stripped.split_whitespace().collect();

    while tokens.len() > 1 {
        let last = tokens[tokens.len() - 1];
        if legal_suffixes.iter().any(|suffix| suffix.eq_ignore_ascii_case(last)) {
            tokens.pop();
        } else {
            break;
        }
    }

    tokens.join(" ")
}

/// Normalise a stable external key (email, domain, code) for exact matching.
pub fn normalize_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Truncate `s` to at most `max_len` Unicode scalar values, appending `"..."` if
/// truncation occurred. `max_len` counts characters (not bytes), making this safe
/// for multi-byte UTF-8 content.
///
/// Special cases:
/// - `max_len == 0` → empty string
/// - `max_len <= 3` → up to `max_len` dots (e.g. `max_len=2` → `".."`)
pub fn truncate_with_ellipsis(s: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max_len {
        return s.to_string();
    }

    if max_len <= 3 {
        return ".".repeat(max_len);
    }

    let keep_chars = max_len - 3;
    let byte_offset = s
        .char_indices()
        .nth(keep_chars)
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    format!("{}...", &s[..byte_offset])
}

/// Extract the first JSON object or array from an extractor response that may
/// be wrapped in markdown.
///
/// Tries, in order:
/// 1. ` ```json ... ``` ` fenced code block
/// 2. ` ``` ... ``` ` fenced code block
/// 3. Bare `{...}` or `[...]` delimited by the first `{`/`[` and last `}`/`]`
///
/// Returns `None` if no JSON-like content is found.
pub fn extract_json_from_response(s: &str) -> Option<&str> {
    if let Some(inner) = extract_fenced_block(s, "```json") {
        return Some(inner);
    }

    if let Some(inner) = extract_fenced_block(s, "```") {
        return Some(inner);
    }

    if let Some(start) = s.find('{') {
        if let Some(end) = s.rfind('}') {
            if end > start {
                return Some(&s[start..=end]);
            }
        }
    }

    if let Some(start) = s.find('[') {
        if let Some(end) = s.rfind(']') {
            if end > start {
                return Some(&s[start..=end]);
            }
        }
    }

    None
}

fn extract_fenced_block<'a>(s: &'a str, fence: &str) -> Option<&'a str> {
    let start = s.find(fence)?;
    let after_fence = start + fence.len();

    let newline = s[after_fence..].find('\n')?;
    let content_start = after_fence + newline + 1;

    let close = s[content_start..].find("```")?;
    let content = s[content_start..content_start + close].trim();

    if content.is_empty() {
        return None;
    }

    Some(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suffixes() -> Vec<String> {
        ["pty", "ltd", "inc", "llc", "gmbh", "corp"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    // --- normalize_whitespace ---

    #[test]
    fn test_normalize_whitespace_basic() {
        assert_eq!(normalize_whitespace("hello   world"), "hello world");
        assert_eq!(normalize_whitespace("hello\t\tworld"), "hello world");
        assert_eq!(normalize_whitespace("  hello\n\nworld  "), "hello world");
    }

    #[test]
    fn test_normalize_whitespace_only_whitespace() {
        assert_eq!(normalize_whitespace("   \t\n  "), "");
        assert_eq!(normalize_whitespace(""), "");
    }

    // --- normalize_entity_name ---

    #[test]
    fn test_entity_name_strips_legal_suffixes() {
        assert_eq!(normalize_entity_name("Acme Pty Ltd", &suffixes()), "acme");
        assert_eq!(normalize_entity_name("ACME PTY LTD", &suffixes()), "acme");
        assert_eq!(normalize_entity_name("Acme Pty. Ltd.", &suffixes()), "acme");
    }

    #[test]
    fn test_entity_name_strips_punctuation() {
        assert_eq!(
            normalize_entity_name("O'Brien & Sons, Inc.", &suffixes()),
            "o brien sons"
        );
    }

    #[test]
    fn test_entity_name_keeps_lone_suffix_word() {
        assert_eq!(normalize_entity_name("Corp", &suffixes()), "corp");
    }

    #[test]
    fn test_entity_name_suffix_only_at_end() {
        assert_eq!(
            normalize_entity_name("Inc Labs", &suffixes()),
            "inc labs"
        );
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  Bob@Acme.com "), "bob@acme.com");
    }

    // --- truncate_with_ellipsis ---

    #[test]
    fn test_truncate_basic() {
        assert_eq!(truncate_with_ellipsis("hello world", 8), "hello...");
        assert_eq!(truncate_with_ellipsis("hi", 10), "hi");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate_with_ellipsis("你好世界测试", 5), "你好...");
    }

    #[test]
    fn test_truncate_tiny_limits() {
        assert_eq!(truncate_with_ellipsis("hello", 0), "");
        assert_eq!(truncate_with_ellipsis("hello", 2), "..");
    }

    // --- extract_json_from_response ---

    #[test]
    fn test_extract_json_fenced_json() {
        let s = "Result:\n```json\n{\"mentions\": []}\n```\nDone.";
        assert_eq!(extract_json_from_response(s), Some("{\"mentions\": []}"));
    }

    #[test]
    fn test_extract_json_bare_object() {
        let s = "The answer is {\"foo\": 42} as shown.";
        assert_eq!(extract_json_from_response(s), Some("{\"foo\": 42}"));
    }

    #[test]
    fn test_extract_json_none() {
        assert_eq!(extract_json_from_response("plain text"), None);
        assert_eq!(extract_json_from_response("```json\n\n```"), None);
    }
}

//! Surface-string similarity functions.

/// Similarity of two already-normalised names in `[0.0, 1.0]`.
///
/// Takes the maximum of the Jaro-Winkler score on the raw strings and the
/// normalised Levenshtein score on their sorted-token forms, so reordered
/// names ("Smith John" / "John Smith") still score highly.
///
/// Returns `0.0` when either side is empty.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }

    let direct = strsim::jaro_winkler(a, b);
    let sorted = strsim::normalized_levenshtein(&token_sort(a), &token_sort(b));

    direct.max(sorted).clamp(0.0, 1.0)
}

/// Sort the whitespace-separated tokens of `s` and re-join them with one space.
pub fn token_sort(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

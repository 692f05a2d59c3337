//! Excerpt grounding: is a quoted excerpt actually present in the fetched document?

/// Share of the excerpt that must be found contiguously or as an in-order word subsequence
const PRESENCE_RATIO: f32 = 0.70;

/// Check that `excerpt` appears in `document`, tolerating minor formatting differences.
///
/// Accepts an exact match after whitespace normalization, a contiguous match of
/// at least 70% of the excerpt, or 70% of the excerpt's words appearing in order.
pub fn excerpt_is_grounded(excerpt: &str, document: &str) -> bool {
    let normalized_excerpt = normalize_whitespace(excerpt).to_lowercase();
    if normalized_excerpt.is_empty() {
        return false;
    }
    let normalized_doc = normalize_whitespace(document).to_lowercase();

    normalized_doc.contains(&normalized_excerpt)
        || is_substantially_present(&normalized_excerpt, &normalized_doc)
        || words_in_order_present(excerpt, document, PRESENCE_RATIO)
}

/// Collapse runs of whitespace and trim
fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercase, strip leading/trailing punctuation
fn normalize_word(w: &str) -> String {
    w.trim_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

/// At least 70% of the (already lower-cased) excerpt occurs as one contiguous substring
fn is_substantially_present(excerpt: &str, document: &str) -> bool {
    let chars: Vec<char> = excerpt.chars().collect();
    let threshold = ((chars.len() as f32) * PRESENCE_RATIO).ceil() as usize;
    if threshold == 0 || threshold > chars.len() {
        return false;
    }

    // Any window of `threshold` chars is contained in every longer window,
    // so checking the shortest admissible windows is enough.
    (0..=chars.len() - threshold).any(|start| {
        let window: String = chars[start..start + threshold].iter().collect();
        document.contains(&window)
    })
}

/// At least `min_ratio` of excerpt words appear in the document in order
fn words_in_order_present(excerpt: &str, document: &str, min_ratio: f32) -> bool {
    let excerpt_words: Vec<String> = excerpt
        .split_whitespace()
        .map(normalize_word)
        .filter(|w| !w.is_empty())
        .collect();
    if excerpt_words.is_empty() {
        return false;
    }

    let doc_words: Vec<String> = document
        .split_whitespace()
        .map(normalize_word)
        .filter(|w| !w.is_empty())
        .collect();

    let mut doc_idx = 0;
    let mut matched = 0;
    // Unmatched excerpt words do not consume document words
    for ew in &excerpt_words {
        if let Some(pos) = doc_words[doc_idx..].iter().position(|w| w == ew) {
            matched += 1;
            doc_idx += pos + 1;
        }
    }

    matched as f32 / excerpt_words.len() as f32 >= min_ratio
}

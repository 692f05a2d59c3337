//! Input normalization
//!
//! Yes/no questions are rewritten into their canonical declarative form before
//! the Understand stage so that "Was X convicted?" and "X was convicted." are
//! analysed identically.

use crate::model::InputType;

/// Auxiliary verbs that open a yes/no question and move behind the subject
const AUXILIARIES: &[&str] = &[
    "is", "are", "was", "were", "do", "does", "did", "has", "have", "had", "can", "could",
    "will", "would", "should", "shall", "may", "might", "must",
];

/// Determiners that start a multi-word subject ("the trial", "this ruling")
const DETERMINERS: &[&str] = &[
    "the", "a", "an", "this", "that", "these", "those", "his", "her", "its", "their", "our",
];

/// Lower-case words allowed inside a proper-noun subject ("Court of Appeals")
const NAME_CONNECTORS: &[&str] = &["of", "de", "da", "do", "dos", "das", "del", "von", "van", "and"];

/// Result of input normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedInput {
    pub original: String,
    /// Declarative statement handed to the Understand stage
    pub canonical: String,
    pub input_type: InputType,
}

/// Normalize raw user input into its canonical statement form
pub fn normalize_input(text: &str) -> NormalizedInput {
    let collapsed = collapse_whitespace(text);
    let trimmed = collapsed.trim_end_matches(['?', '.', '!']).trim();

    let is_question = collapsed.ends_with('?') || starts_with_auxiliary(trimmed);

    let canonical = if is_question {
        question_to_statement(trimmed).unwrap_or_else(|| trimmed.to_string())
    } else {
        trimmed.to_string()
    };

    NormalizedInput {
        original: text.to_string(),
        canonical: finish_sentence(&canonical),
        input_type: if is_question {
            InputType::Question
        } else {
            InputType::Statement
        },
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn starts_with_auxiliary(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .is_some_and(|w| AUXILIARIES.contains(&w.to_lowercase().as_str()))
}

/// "Was X convicted" -> "X was convicted"
fn question_to_statement(question: &str) -> Option<String> {
    let words: Vec<&str> = question.split_whitespace().collect();
    let (aux, rest) = words.split_first()?;
    let aux = aux.to_lowercase();
    if !AUXILIARIES.contains(&aux.as_str()) || rest.is_empty() {
        return None;
    }

    let subject_len = subject_length(rest);
    if subject_len == 0 || subject_len >= rest.len() {
        return None;
    }

    let (subject, predicate) = rest.split_at(subject_len);
    Some(format!("{} {} {}", subject.join(" "), aux, predicate.join(" ")))
}

/// Number of leading words forming the grammatical subject
fn subject_length(words: &[&str]) -> usize {
    let first = words[0];
    let first_lower = first.to_lowercase();

    if DETERMINERS.contains(&first_lower.as_str()) {
        // Determiner, then a proper name or a single noun
        let len = proper_name_end(words, 1);
        return if len == 1 && words.len() > 1 { 2 } else { len };
    }

    if is_capitalized(first) {
        return proper_name_end(words, 1);
    }

    // Pronoun or lower-case noun subject
    1
}

/// Index after the run of capitalized words (and connectors) starting at `start`
fn proper_name_end(words: &[&str], start: usize) -> usize {
    let mut end = start;
    while end < words.len() {
        let word = words[end];
        let connects = is_capitalized(words[end - 1])
            && NAME_CONNECTORS.contains(&word.to_lowercase().as_str())
            && words.get(end + 1).is_some_and(|next| is_capitalized(next));
        if is_capitalized(word) || connects {
            end += 1;
        } else {
            break;
        }
    }
    end
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().is_some_and(|c| c.is_uppercase() || c.is_ascii_digit())
}

/// Capitalize the first letter and terminate with a period
fn finish_sentence(text: &str) -> String {
    let mut chars = text.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    format!("{}{}.", first.to_uppercase(), chars.as_str())
}

//! Final-answer extraction.
//!
//! Priority: last `\boxed{…}` / `\fbox{…}` anywhere in the text, then a
//! "final answer is …" phrase after the thinking section, then the last
//! number after the thinking section.

use super::format::after_think;
use regex::Regex;
use std::sync::LazyLock;

const BOX_COMMANDS: [&str; 2] = ["\\boxed", "\\fbox"];

static FINAL_ANSWER_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)final answer\s*(?:is|:)\s*:?\s*(.+?)\s*$").expect("valid phrase pattern")
});

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"-?(?:\d{1,3}(?:,\d{3})+|\d+)(?:\.\d+)?|-?\.\d+").expect("valid number pattern")
});

/// Content of the last well-formed box command, braces balanced.
///
/// A box cut off mid-content (unbalanced) is skipped in favor of an earlier one.
pub fn last_boxed(text: &str) -> Option<String> {
    let mut starts: Vec<(usize, usize)> = BOX_COMMANDS
        .iter()
        .flat_map(|cmd| text.match_indices(cmd).map(|(pos, m)| (pos, pos + m.len())))
        .collect();
    starts.sort_unstable();

    starts
        .into_iter()
        .rev()
        .find_map(|(_, after)| box_content(&text[after..]))
}

/// Parse what follows `\boxed`: either `{balanced}` or ` token`.
fn box_content(rest: &str) -> Option<String> {
    if let Some(inner) = rest.strip_prefix('{') {
        let mut depth = 1usize;
        for (idx, ch) in inner.char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        let content = inner[..idx].trim();
                        return (!content.is_empty()).then(|| content.to_string());
                    }
                }
                _ => {}
            }
        }
        return None;
    }

    // `\boxed 5` form: one whitespace-delimited token
    let trimmed = rest.strip_prefix(' ')?;
    let token: String = trimmed
        .chars()
        .take_while(|c| !c.is_whitespace() && *c != '$')
        .collect();
    (!token.is_empty()).then_some(token)
}

/// Extract the final answer from a model trace.
pub fn extract_answer(text: &str) -> Option<String> {
    if let Some(boxed) = last_boxed(text) {
        return Some(boxed);
    }

    let tail = after_think(text);
    if let Some(caps) = FINAL_ANSWER_PHRASE.captures_iter(tail).last() {
        let phrase = caps[1].trim_matches(|c: char| c == '$' || c == '.' || c.is_whitespace());
        if !phrase.is_empty() {
            return Some(phrase.to_string());
        }
    }

    NUMBER.find_iter(tail).last().map(|m| m.as_str().to_string())
}

/// The comparable part of a ground-truth answer.
///
/// Boxed content when the answer carries a box, the part after a `####`
/// marker (GSM8K style), the whole trimmed text otherwise.
pub fn gold_answer(answer: &str) -> String {
    if let Some(boxed) = last_boxed(answer) {
        return boxed;
    }
    match answer.rfind("####") {
        Some(pos) => answer[pos + 4..].trim().to_string(),
        None => answer.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_boxed_wins() {
        let text = "<think>maybe \\boxed{3}</think>So \\boxed{4}.";
        assert_eq!(extract_answer(text).as_deref(), Some("4"));
    }

    #[test]
    fn test_nested_braces() {
        assert_eq!(
            last_boxed("\\boxed{\\frac{1}{2}}").as_deref(),
            Some("\\frac{1}{2}")
        );
        assert_eq!(last_boxed("\\fbox{x^{2}}").as_deref(), Some("x^{2}"));
    }

    #[test]
    fn test_unbalanced_box_falls_back_to_earlier() {
        assert_eq!(
            last_boxed("\\boxed{7} then \\boxed{\\frac{1}{2").as_deref(),
            Some("7")
        );
        assert_eq!(last_boxed("\\boxed{"), None);
    }

    #[test]
    fn test_space_form() {
        assert_eq!(last_boxed("answer: $\\boxed 5$").as_deref(), Some("5"));
    }

    #[test]
    fn test_phrase_and_number_fallbacks() {
        assert_eq!(
            extract_answer("<think>2, 3</think>The final answer is $12$.").as_deref(),
            Some("12")
        );
        assert_eq!(
            extract_answer("<think>try 10</think>So we get 1,250 apples").as_deref(),
            Some("1,250")
        );
        assert_eq!(extract_answer("<think>7</think>no digits here"), None);
    }

    #[test]
    fn test_gold_answer_forms() {
        assert_eq!(gold_answer(" 42 "), "42");
        assert_eq!(gold_answer("so $\\boxed{\\frac{3}{4}}$"), "\\frac{3}{4}");
        assert_eq!(gold_answer("She pays 5 + 3 = 8\n#### 8"), "8");
    }
}

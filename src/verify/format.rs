//! Structural check on the thinking section.

use regex::Regex;
use std::sync::LazyLock;

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

static THINK_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^<think>.*?</think>").expect("valid think pattern"));

/// True iff the trace opens with `<think>` at position zero, closes it, and
/// neither delimiter appears anywhere else.
pub fn check_format(text: &str) -> bool {
    THINK_BLOCK.is_match(text)
        && text.matches(THINK_OPEN).count() == 1
        && text.matches(THINK_CLOSE).count() == 1
}

/// Text after the last `</think>`, or the whole text when there is none.
pub fn after_think(text: &str) -> &str {
    match text.rfind(THINK_CLOSE) {
        Some(pos) => &text[pos + THINK_CLOSE.len()..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_well_formed() {
        assert!(check_format("<think>reasoning</think>final answer"));
        assert!(check_format("<think>\nline one\nline two\n</think>\n\\boxed{4}"));
        assert!(check_format("<think></think>"));
    }

    #[test]
    fn test_must_start_at_zero() {
        assert!(!check_format(" <think>reasoning</think>answer"));
        assert!(!check_format("\n<think>reasoning</think>answer"));
        assert!(!check_format("Sure! <think>reasoning</think>answer"));
        assert!(!check_format("reasoning</think>answer"));
    }

    #[test]
    fn test_delimiters_exactly_once() {
        assert!(!check_format("<think>a<think>b</think>c"));
        assert!(!check_format("<think>a</think>b</think>"));
        assert!(!check_format("<think>foo"));
        assert!(!check_format("\\boxed{4}"));
        assert!(!check_format(""));
    }

    #[test]
    fn test_after_think() {
        assert_eq!(after_think("<think>x</think> 42"), " 42");
        assert_eq!(after_think("no tags"), "no tags");
    }
}

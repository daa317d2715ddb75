//! Surface normalization of LaTeX-ish answers before comparison.

use regex::Regex;
use std::sync::LazyLock;

static TEXT_WRAPPER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:text|textbf|textit|textrm|mathrm|mathbf|mathit|mbox|operatorname)\s*\{([^{}]*)\}")
        .expect("valid wrapper pattern")
});

static LEFT_RIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(?:left|right|big|Big|bigg|Bigg)\b").expect("valid sizing pattern"));

static SPACING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\\(?:[,;:! ]|qquad\b|quad\b)|~").expect("valid spacing pattern"));

static DEGREES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\^\s*\{?\s*\\circ\s*\}?|°").expect("valid degree pattern"));

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z](?:_\{?[A-Za-z0-9]+\}?)?\s*=\s*(.+)$").expect("valid assignment pattern")
});

static GROUPED_NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?\d{1,3}(?:,\d{3})+(?:\.\d+)?$").expect("valid grouped number pattern")
});

/// Strip presentation noise from an answer.
///
/// The result keeps interior whitespace; use [`compact`] for text equality.
pub fn normalize(answer: &str) -> String {
    let mut s = answer.trim().to_string();

    for delim in ["$", "\\(", "\\)", "\\[", "\\]"] {
        s = s.replace(delim, "");
    }
    s = s.replace("\\displaystyle", "");
    s = s.replace("{,}", ",");
    s = s.replace("\\dfrac", "\\frac").replace("\\tfrac", "\\frac");

    s = LEFT_RIGHT.replace_all(&s, "").into_owned();
    s = SPACING.replace_all(&s, " ").into_owned();
    // Unwrap repeatedly; wrappers can nest
    while TEXT_WRAPPER.is_match(&s) {
        s = TEXT_WRAPPER.replace_all(&s, "$1").into_owned();
    }
    s = DEGREES.replace_all(&s, "").into_owned();
    s = s.replace("\\%", "").replace('%', "");

    let mut s = s.trim().trim_end_matches('.').trim().to_string();

    if s.matches('=').count() == 1 {
        if let Some(caps) = ASSIGNMENT.captures(&s) {
            s = caps[1].trim().to_string();
        }
    }

    if GROUPED_NUMBER.is_match(&s) {
        s = s.replace(',', "");
    }

    s
}

/// Normalized text with all whitespace removed.
pub fn compact(normalized: &str) -> String {
    normalized.chars().filter(|c| !c.is_whitespace()).collect()
}

//! Mathematical equivalence of two answers.

use super::expr::Expr;
use super::normalize::{compact, normalize};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Relative tolerance for numeric comparison.
pub const RELATIVE_TOLERANCE: f64 = 1e-6;

/// Upper bound on the absolute difference the relative tolerance may allow.
const MAX_ABSOLUTE_ERROR: f64 = 1e-4;

/// Longer answers are only compared textually.
const MAX_ANSWER_CHARS: usize = 1000;

/// Values substituted for free variables.
const SAMPLE_POINTS: [f64; 5] = [0.37, 1.29, 2.71, -0.83, 4.13];

/// Sample points that must evaluate on both sides.
const MIN_VALID_SAMPLES: usize = 3;

static CHOICE_LETTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\(?([A-Ja-j])\)?$").expect("valid choice pattern"));

static DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([-+]?)(\d*)(?:\.(\d+))?$").expect("valid decimal pattern"));

/// How a comma-separated answer is delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ListForm {
    /// `\{a, b\}` or bare `a, b`: order does not matter
    Unordered,
    /// `(a, b]` and friends: order and delimiters matter
    Ordered { open: char, close: char },
}

/// Whether `candidate` and `gold` denote the same answer.
pub fn is_equivalent(candidate: &str, gold: &str) -> bool {
    let candidate = normalize(candidate);
    let gold = normalize(gold);
    equivalent_normalized(&candidate, &gold)
}

fn equivalent_normalized(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if compact(a) == compact(b) {
        return true;
    }
    if a.len() > MAX_ANSWER_CHARS || b.len() > MAX_ANSWER_CHARS {
        return false;
    }

    if let (Some(x), Some(y)) = (choice_letter(a), choice_letter(b)) {
        return x.eq_ignore_ascii_case(&y);
    }

    match (split_list(a), split_list(b)) {
        (Some((form_a, items_a)), Some((form_b, items_b))) => {
            form_a == form_b && lists_equivalent(&form_a, &items_a, &items_b)
        }
        (None, None) => scalars_equivalent(a, b),
        _ => false,
    }
}

fn choice_letter(s: &str) -> Option<char> {
    let caps = CHOICE_LETTER.captures(s)?;
    caps[1].chars().next()
}

fn lists_equivalent(form: &ListForm, a: &[String], b: &[String]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    match form {
        ListForm::Ordered { .. } => a
            .iter()
            .zip(b)
            .all(|(x, y)| equivalent_normalized(x, y)),
        ListForm::Unordered => {
            let mut used = vec![false; b.len()];
            a.iter().all(|x| {
                let hit = b
                    .iter()
                    .enumerate()
                    .find(|(idx, y)| !used[*idx] && equivalent_normalized(x, y))
                    .map(|(idx, _)| idx);
                match hit {
                    Some(idx) => {
                        used[idx] = true;
                        true
                    }
                    None => false,
                }
            })
        }
    }
}

/// Split on top-level commas. `None` for a single value.
fn split_top_level(s: &str) -> Option<Vec<String>> {
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();

    for ch in s.chars() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                items.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    items.push(current.trim().to_string());

    (items.len() > 1).then_some(items)
}

/// Whether the bracket opening `s` closes at its last character.
fn wraps_whole(s: &str) -> bool {
    let mut depth = 0i32;
    let last = s.chars().count().saturating_sub(1);
    for (idx, ch) in s.chars().enumerate() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return idx == last;
                }
            }
            _ => {}
        }
    }
    false
}

fn split_list(s: &str) -> Option<(ListForm, Vec<String>)> {
    if let Some(inner) = s.strip_prefix("\\{").and_then(|r| r.strip_suffix("\\}")) {
        return Some((ListForm::Unordered, split_top_level(inner)?));
    }

    let first = s.chars().next()?;
    let last = s.chars().last()?;
    if matches!(first, '(' | '[') && matches!(last, ')' | ']') && wraps_whole(s) {
        let inner = &s[first.len_utf8()..s.len() - last.len_utf8()];
        if let Some(items) = split_top_level(inner) {
            return Some((
                ListForm::Ordered {
                    open: first,
                    close: last,
                },
                items,
            ));
        }
    }

    split_top_level(s).map(|items| (ListForm::Unordered, items))
}

/// Sign, integer digits and fraction digits of a plain decimal literal,
/// without insignificant zeros.
fn decimal_literal(s: &str) -> Option<(bool, String, String)> {
    let caps = DECIMAL.captures(s)?;
    let integer = caps[2].trim_start_matches('0');
    let fraction = caps.get(3).map_or("", |m| m.as_str());
    if caps[2].is_empty() && fraction.is_empty() {
        return None;
    }
    let fraction = fraction.trim_end_matches('0');
    let negative = &caps[1] == "-" && !(integer.is_empty() && fraction.is_empty());
    Some((negative, integer.to_string(), fraction.to_string()))
}

fn close(a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return false;
    }
    if a.is_infinite() || b.is_infinite() {
        return a == b;
    }
    if a.fract() == 0.0 && b.fract() == 0.0 {
        return a == b;
    }
    let scale = a.abs().max(b.abs()).max(f64::MIN_POSITIVE);
    (a - b).abs() <= (RELATIVE_TOLERANCE * scale).min(MAX_ABSOLUTE_ERROR)
}

fn scalars_equivalent(a: &str, b: &str) -> bool {
    // Two literals are compared digit by digit
    if let (Some(x), Some(y)) = (decimal_literal(&compact(a)), decimal_literal(&compact(b))) {
        return x == y;
    }

    let (Some(x), Some(y)) = (Expr::parse(a), Expr::parse(b)) else {
        return false;
    };

    let mut variables = x.variables();
    variables.extend(y.variables());

    if variables.is_empty() {
        let empty = BTreeMap::new();
        return match (x.eval(&empty), y.eval(&empty)) {
            (Some(u), Some(v)) => close(u, v),
            _ => false,
        };
    }

    let mut valid = 0;
    for k in 0..SAMPLE_POINTS.len() {
        let bindings: BTreeMap<String, f64> = variables
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let point = SAMPLE_POINTS[(k + 2 * j) % SAMPLE_POINTS.len()] + 0.11 * j as f64;
                (name.clone(), point)
            })
            .collect();

        match (x.eval(&bindings), y.eval(&bindings)) {
            (Some(u), Some(v)) if u.is_finite() && v.is_finite() => {
                if !close(u, v) {
                    return false;
                }
                valid += 1;
            }
            _ => {}
        }
    }
    valid >= MIN_VALID_SAMPLES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_forms() {
        assert!(is_equivalent("9.80", "9.8"));
        assert!(is_equivalent("0.5", "\\frac{1}{2}"));
        assert!(is_equivalent("\\dfrac{3}{4}", "0.75"));
        assert!(is_equivalent("1,000", "1000"));
        assert!(!is_equivalent("185", "180"));
        assert!(!is_equivalent("0.333", "\\frac{1}{3}"));
    }

    #[test]
    fn test_algebraic_forms() {
        assert!(is_equivalent("x+1", "1+x"));
        assert!(is_equivalent("(x+1)^2", "x^2+2x+1"));
        assert!(is_equivalent("2\\sqrt{2}", "\\sqrt{8}"));
        assert!(is_equivalent("\\frac{\\pi}{2}", "\\pi/2"));
        assert!(!is_equivalent("x+1", "x-1"));
        assert!(!is_equivalent("x", "y"));
    }

    #[test]
    fn test_presentation_noise() {
        assert!(is_equivalent("$x = 5$", "5"));
        assert!(is_equivalent("30^\\circ", "30"));
        assert!(is_equivalent("\\text{(C)}", "c"));
        assert!(!is_equivalent("(A)", "B"));
    }

    #[test]
    fn test_lists() {
        assert!(is_equivalent("\\{3, 1, 2\\}", "\\{1,2,3\\}"));
        assert!(is_equivalent("2, -1", "-1, 2"));
        assert!(is_equivalent("(1, \\frac{1}{2})", "(1, 0.5)"));
        assert!(!is_equivalent("(1, 2)", "(2, 1)"));
        assert!(!is_equivalent("[0, 1)", "(0, 1)"));
        assert!(!is_equivalent("1, 2", "1, 2, 3"));
        assert!(!is_equivalent("1, 2", "3"));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        assert!(!is_equivalent("1000001", "1000000"));
        assert!(!is_equivalent("2000001", "2000000"));
        assert!(!is_equivalent("12345679", "12345678"));
        assert!(!is_equivalent("\\frac{2000002}{2}", "1000000"));
        assert!(!is_equivalent("1000000.5", "1000000"));
        assert!(is_equivalent("\\frac{2000002}{2}", "1000001"));
        assert!(is_equivalent("1000000.0", "1000000"));
        assert!(is_equivalent("0.50", ".5"));
        assert!(is_equivalent("-0", "0"));
    }

    #[test]
    fn test_oversized_answers_only_match_textually() {
        let nested = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        assert!(!is_equivalent(&nested, "1"));
        assert!(is_equivalent(&nested, &nested));
    }

    #[test]
    fn test_empty_never_matches() {
        assert!(!is_equivalent("", ""));
        assert!(!is_equivalent("4", ""));
        assert!(!is_equivalent("hello", "world"));
    }
}

//! Invoice number recovery
//!
//! Electronic VAT invoices carry a 20-digit number. Older layouts print a
//! 12-digit invoice code and an 8-digit invoice number separately, which the
//! permissive variant glues back together.

use regex::Regex;
use std::sync::LazyLock;

/// Length of a complete invoice number
pub const FULL_LEN: usize = 20;

const CODE_LEN: usize = 12;
const NUMBER_LEN: usize = 8;

static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").expect("static regex"));

fn ascii_digits(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Digit runs of the raw text, in order
fn digit_runs(text: &str) -> Vec<&str> {
    DIGIT_RUN
        .find_iter(text)
        .map(|m| m.as_str())
        // `\d` is Unicode aware; keep only runs made of ASCII digits
        .filter(|run| run.bytes().all(|b| b.is_ascii_digit()))
        .collect()
}

/// Whether the text contains 20 digits once everything else is stripped
pub fn has_full_number(text: &str) -> bool {
    strict(text).is_some()
}

/// Strict variant: the first 20 digits after stripping non-digits, or `None`
/// when fewer than 20 remain. No concatenation fallback.
pub fn strict(text: &str) -> Option<String> {
    let digits = ascii_digits(text);
    if digits.len() >= FULL_LEN {
        Some(digits[..FULL_LEN].to_string())
    } else {
        None
    }
}

/// `true` iff the strict result exists and is exactly 20 digits
pub fn is_complete(number: Option<&str>) -> bool {
    number.is_some_and(|n| n.len() == FULL_LEN && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Permissive variant, in order of preference:
/// 1. 20 digits after stripping non-digits
/// 2. a 12-digit code plus an 8-digit number, preferring the first 8-digit
///    run after the code
/// 3. the code or the number alone
/// 4. the longest digit run
pub fn permissive(text: &str) -> Option<String> {
    if let Some(full) = strict(text) {
        return Some(full);
    }

    let runs = digit_runs(text);
    let code_idx = runs.iter().position(|r| r.len() >= CODE_LEN);
    let code = code_idx.map(|i| &runs[i][..CODE_LEN]);

    let number = match code_idx {
        Some(ci) => runs
            .iter()
            .skip(ci + 1)
            .chain(runs.iter().take(ci))
            .find(|r| r.len() >= NUMBER_LEN)
            .map(|r| &r[..NUMBER_LEN]),
        None => runs.iter().find(|r| r.len() >= NUMBER_LEN).map(|r| &r[..NUMBER_LEN]),
    };

    match (code, number) {
        (Some(code), Some(number)) => Some(format!("{code}{number}")),
        (Some(code), None) => Some(code.to_string()),
        (None, Some(number)) => Some(number.to_string()),
        (None, None) => runs
            .iter()
            .fold(None::<&str>, |best, r| match best {
                Some(b) if b.len() >= r.len() => Some(b),
                _ => Some(r),
            })
            .map(str::to_string),
    }
}

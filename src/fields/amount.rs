//! Total amount canonicalization

use regex::Regex;
use std::sync::LazyLock;

static TWO_DECIMALS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+\.\d{2})").expect("static regex"));
static ANY_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d{1,2})?)").expect("static regex"));

/// Strip thousands separators, currency marks and whitespace, then take the
/// first two-decimal number, falling back to any number. `None` without
/// digits.
pub fn normalize(text: &str) -> Option<String> {
    let cleaned: String = text
        .replace("RMB", "")
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, ',' | '¥' | '￥'))
        .collect();

    TWO_DECIMALS
        .find(&cleaned)
        .or_else(|| ANY_NUMBER.find(&cleaned))
        .map(|m| m.as_str().to_string())
        // `\d` matches non-ASCII digits too
        .filter(|s| s.bytes().all(|b| b.is_ascii_digit() || b == b'.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_and_separators() {
        assert_eq!(normalize("￥1,234.50").as_deref(), Some("1234.50"));
        assert_eq!(normalize("¥ 88.00").as_deref(), Some("88.00"));
        assert_eq!(normalize("RMB 99").as_deref(), Some("99"));
    }

    #[test]
    fn test_two_decimals_preferred() {
        // The first number has one decimal, the later one two
        assert_eq!(normalize("税 3.5 合计 120.00").as_deref(), Some("120.00"));
    }

    #[test]
    fn test_one_decimal_fallback() {
        assert_eq!(normalize("小写 12.5").as_deref(), Some("12.5"));
    }

    #[test]
    fn test_no_digits() {
        assert!(normalize("").is_none());
        assert!(normalize("价税合计").is_none());
    }

    #[test]
    fn test_canonical_amount_is_fixed_point() {
        for raw in ["￥1,234.50", "RMB 99", "12.5"] {
            let once = normalize(raw).unwrap();
            assert_eq!(normalize(&once).as_deref(), Some(once.as_str()));
        }
    }
}
